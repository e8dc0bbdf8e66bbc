use std::fmt;

use crate::linear_collections::{LinMap, LinMultiMap};

/// Label is analogous to an assembly language label: a name for a code
/// offset that may not be known yet when a jump to it is emitted.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Label(u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ".L{}", self.0)
    }
}

/// Width of a label reference in the byte stream. All references are
/// little-endian rel32 displacements measured from the end of the field.
pub const DISPLACEMENT_WIDTH: usize = 4;

/// An append-only byte buffer with symbolic jump targets.
///
/// A reference to a label that is not defined yet leaves a zeroed
/// placeholder and records the patch site. Defining the label rewrites every
/// recorded site at once, so by the time the last label is defined the
/// buffer holds final machine code.
pub struct CodeBuffer {
    bytes: Vec<u8>,
    defined: LinMap<Label, usize>,
    pending: LinMultiMap<Label, usize>,
    next_label: u32,
}

impl CodeBuffer {
    pub fn new() -> CodeBuffer {
        CodeBuffer {
            bytes: Vec::new(),
            defined: LinMap::new(),
            pending: LinMultiMap::new(),
            next_label: 1,
        }
    }

    pub fn alloc_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// The offset the next emitted byte will land at.
    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn emit(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn emit_i32(&mut self, value: i32) {
        self.emit(&value.to_le_bytes());
    }

    /// Emits a rel32 reference to `label`. Backward references are resolved
    /// on the spot; forward ones are patched by `define_label`.
    pub fn emit_label_ref(&mut self, label: Label) {
        self.check_allocated(label);
        let site = self.offset();
        self.emit_i32(0);
        match self.defined.get(&label) {
            Some(target) => self.patch(site, target),
            None => self.pending.insert(label, site),
        }
    }

    /// Binds `label` to the current offset and resolves every pending
    /// reference to it.
    ///
    /// Panics if `label` was already defined.
    pub fn define_label(&mut self, label: Label) {
        self.check_allocated(label);
        let target = self.offset();
        if let Some(previous) = self.defined.insert(label, target) {
            panic!("{} defined twice (at {:#x} and {:#x})", label, previous, target);
        }
        let sites = self.pending.remove_all(&label);
        log::trace!("{} = {:#x}, patching {} site(s)", label, target, sites.len());
        for site in sites {
            self.patch(site, target);
        }
    }

    pub fn is_defined(&self, label: Label) -> bool {
        self.defined.get(&label).is_some()
    }

    /// Patch sites still waiting on `label`.
    pub fn pending_sites(&self, label: Label) -> Vec<usize> {
        self.pending.get_all(&label).into_iter().copied().collect()
    }

    /// Finalizes the buffer.
    ///
    /// Panics if any referenced label was never defined; that is a bug in
    /// the code generator, not something a pattern can cause.
    pub fn finish(self) -> Vec<u8> {
        if !self.pending.is_empty() {
            let unresolved: Vec<String> = self.pending.keys().map(|l| l.to_string()).collect();
            panic!("unresolved label references: {}", unresolved.join(", "));
        }
        self.bytes
    }

    fn check_allocated(&self, label: Label) {
        assert!(
            label.0 >= 1 && label.0 < self.next_label,
            "{} was not allocated by this buffer",
            label
        );
    }

    fn patch(&mut self, site: usize, target: usize) {
        let rel = displacement(site, target);
        self.bytes[site..site + DISPLACEMENT_WIDTH].copy_from_slice(&rel.to_le_bytes());
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The rel32 value that makes a reference at `site` land on `target`.
pub fn displacement(site: usize, target: usize) -> i32 {
    let rel = target as i64 - (site + DISPLACEMENT_WIDTH) as i64;
    i32::try_from(rel).expect("jump displacement exceeds rel32 range")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel_at(bytes: &[u8], site: usize) -> i32 {
        i32::from_le_bytes(bytes[site..site + 4].try_into().unwrap())
    }

    #[test]
    fn test_labels_count_up_from_one() {
        let mut buf = CodeBuffer::new();
        assert_eq!(buf.alloc_label(), Label(1));
        assert_eq!(buf.alloc_label(), Label(2));
        assert_eq!(buf.alloc_label(), Label(3));
    }

    #[test]
    fn test_forward_reference_is_patched() {
        let mut buf = CodeBuffer::new();
        let label = buf.alloc_label();
        buf.emit(&[0xe9]);
        buf.emit_label_ref(label);
        assert_eq!(buf.pending_sites(label), vec![1]);
        assert_eq!(&buf.bytes()[1..5], &[0, 0, 0, 0]);

        buf.emit(&[0x90, 0x90, 0x90]);
        buf.define_label(label);
        assert!(buf.pending_sites(label).is_empty());

        let code = buf.finish();
        // Target 8, reference field ends at 5.
        assert_eq!(rel_at(&code, 1), 3);
    }

    #[test]
    fn test_backward_reference_matches_deferred_patch() {
        // Jump from offset 10 back to offset 2, once with the label already
        // defined and once with the reference recorded first.
        let mut backward = CodeBuffer::new();
        let label = backward.alloc_label();
        backward.emit(&[0x90; 2]);
        backward.define_label(label);
        backward.emit(&[0x90; 8]);
        backward.emit_label_ref(label);
        let backward = backward.finish();

        assert_eq!(rel_at(&backward, 10), -12);
        assert_eq!(displacement(10, 2), -12);

        let mut forward = CodeBuffer::new();
        let label = forward.alloc_label();
        forward.emit(&[0x90; 2]);
        forward.emit_label_ref(label);
        forward.emit(&[0x90; 6]);
        forward.define_label(label);
        let forward = forward.finish();
        assert_eq!(rel_at(&forward, 2), displacement(2, 12));
    }

    #[test]
    fn test_many_sites_one_label() {
        let mut buf = CodeBuffer::new();
        let exit = buf.alloc_label();
        let other = buf.alloc_label();
        buf.emit_label_ref(exit);
        buf.emit_label_ref(other);
        buf.emit_label_ref(exit);
        assert_eq!(buf.pending_sites(exit), vec![0, 8]);

        buf.define_label(exit);
        assert!(buf.is_defined(exit));
        assert!(!buf.is_defined(other));
        buf.define_label(other);

        let code = buf.finish();
        assert_eq!(rel_at(&code, 0), 8);
        assert_eq!(rel_at(&code, 4), 4);
        assert_eq!(rel_at(&code, 8), 0);
    }

    #[test]
    fn test_reference_to_self_offset() {
        // `jmp .` style: the label sits where the reference field starts.
        let mut buf = CodeBuffer::new();
        let here = buf.alloc_label();
        buf.define_label(here);
        buf.emit_label_ref(here);
        assert_eq!(rel_at(buf.bytes(), 0), -4);
    }

    #[test]
    #[should_panic(expected = "defined twice")]
    fn test_define_twice_panics() {
        let mut buf = CodeBuffer::new();
        let label = buf.alloc_label();
        buf.define_label(label);
        buf.emit(&[0xc3]);
        buf.define_label(label);
    }

    #[test]
    #[should_panic(expected = "unresolved label references: .L2")]
    fn test_finish_with_pending_reference_panics() {
        let mut buf = CodeBuffer::new();
        let _unused = buf.alloc_label();
        let label = buf.alloc_label();
        buf.emit_label_ref(label);
        buf.finish();
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn test_foreign_label_panics() {
        let mut other = CodeBuffer::new();
        other.alloc_label();
        let foreign = other.alloc_label();

        let mut buf = CodeBuffer::new();
        buf.alloc_label();
        buf.emit_label_ref(foreign);
    }
}

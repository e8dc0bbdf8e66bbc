//! Lowers a parsed `Regex` to a backtracking matcher in machine code.
//!
//! The generated function has the signature
//! `extern "sysv64" fn(cursor: *const u8, line_start: *const u8) -> bool`
//! and answers whether the pattern matches starting exactly at `cursor`.
//!
//! ```text
//!     push rbp; mov rbp, rsp; [sub rsp, 8 * slots]
//!     <choice point: global_fail, entry cursor>
//!     <pattern>               ; falls through on success
//!     mov eax, 1; mov rsp, rbp; pop rbp; ret
//! backtrack:
//!     pop rdi; ret            ; resume at the most recent choice point
//! global_fail:
//!     xor eax, eax; mov rsp, rbp; pop rbp; ret
//! ```
//!
//! Every mismatch jumps to `backtrack`. The sentinel choice point guarantees
//! there is always something to pop, so the search always terminates.
//!
//! Choice points live on the native stack, so stack use grows with the
//! input. `StackUse` bounds it per consumed byte: a push site inside `n`
//! nested loops runs at most `n` times per byte, since every loop iteration
//! either consumes input or leaves the loop.

use crate::code_buffer::{CodeBuffer, Label};
use crate::machine::{assemble, Op};
use crate::regex::Regex;

/// Size of a choice point: resume address and saved cursor.
const CHOICE_POINT: usize = 16;
/// Size of a frame slot, and of its saved copy.
const SLOT: usize = 8;

/// Upper bound on the native stack a compiled matcher uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StackUse {
    /// Bytes used regardless of the input: return address, frame, sentinel
    /// choice point, and pushes outside any loop.
    pub fixed: usize,
    /// Bytes that may be pushed for every byte of the line.
    pub per_byte: usize,
}

impl StackUse {
    /// Worst-case stack use for a line of `line_len` bytes, saturating.
    pub fn bound(&self, line_len: usize) -> usize {
        self.per_byte
            .saturating_mul(line_len.saturating_add(1))
            .saturating_add(self.fixed)
    }
}

/// A compiled pattern before it is made executable.
pub struct Program {
    pub code: Vec<u8>,
    pub ops: Vec<Op>,
    /// Frame slots reserved by the prologue.
    pub slots: u32,
    pub stack: StackUse,
}

impl Program {
    /// The program as Intel-syntax assembly, one op per line.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for op in &self.ops {
            out.push_str(&op.to_string());
            out.push('\n');
        }
        out
    }
}

/// Compiles `root` to machine code. `None`, the empty pattern, compiles to a
/// matcher that always succeeds without consuming input.
pub fn compile(root: Option<&Regex>) -> Program {
    let mut buf = CodeBuffer::new();
    let backtrack = buf.alloc_label();
    let global_fail = buf.alloc_label();
    let slots = root.map_or(0, guarded_loops);

    let mut compiler = Compiler {
        buf,
        ops: Vec::new(),
        backtrack,
        next_slot: 0,
        loop_depth: 0,
        stack: StackUse {
            // return address, saved rbp, slots, sentinel
            fixed: 2 * SLOT + SLOT * slots as usize + CHOICE_POINT,
            per_byte: 0,
        },
    };

    compiler.push(Op::Enter { slots });
    compiler.push(Op::PushChoice(global_fail));
    if let Some(root) = root {
        compiler.compile_node(root);
    }
    compiler.push(Op::Leave { matched: true });

    compiler.push(Op::Label(backtrack));
    compiler.push(Op::Backtrack);

    compiler.push(Op::Label(global_fail));
    compiler.push(Op::Leave { matched: false });

    debug_assert_eq!(compiler.next_slot, slots);

    let Compiler { buf, ops, stack, .. } = compiler;
    let code = assemble(buf, &ops);
    let program = Program {
        code,
        ops,
        slots,
        stack,
    };
    log::debug!(
        "compiled {} ops into {} bytes, {} frame slot(s), stack {:?}",
        program.ops.len(),
        program.code.len(),
        slots,
        stack
    );
    if log::log_enabled!(log::Level::Trace) {
        log::trace!("listing:\n{}", program.listing());
    }
    program
}

/// Repetitions whose body can match the empty string. Each gets a frame
/// slot for its empty-iteration check.
fn guarded_loops(regex: &Regex) -> u32 {
    match regex {
        Regex::Literal(_) | Regex::Any | Regex::LineStart | Regex::LineEnd | Regex::Empty => 0,
        Regex::Concat(l, r) | Regex::Choice(l, r) => guarded_loops(l) + guarded_loops(r),
        Regex::Repeat(body) => guarded_loops(body) + u32::from(body.can_match_empty()),
    }
}

struct Compiler {
    buf: CodeBuffer,
    ops: Vec<Op>,
    backtrack: Label,
    next_slot: u32,
    loop_depth: usize,
    stack: StackUse,
}

impl Compiler {
    fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    fn label(&mut self) -> Label {
        self.buf.alloc_label()
    }

    /// Accounts for `bytes` pushed by a site at the current loop depth.
    fn pushes(&mut self, bytes: usize) {
        if self.loop_depth == 0 {
            self.stack.fixed += bytes;
        } else {
            self.stack.per_byte += bytes * self.loop_depth;
        }
    }

    fn compile_node(&mut self, regex: &Regex) {
        match regex {
            Regex::Literal(c) => {
                self.push(Op::CmpByte(*c));
                self.push(Op::JumpIfNe(self.backtrack));
                self.push(Op::Advance);
            }
            Regex::Any => {
                self.push(Op::CmpByte(0));
                self.push(Op::JumpIfEq(self.backtrack));
                self.push(Op::Advance);
            }
            Regex::Concat(l, r) => {
                self.compile_node(l);
                self.compile_node(r);
            }
            Regex::Choice(l, r) => {
                let right = self.label();
                let end = self.label();
                self.pushes(CHOICE_POINT);
                self.push(Op::PushChoice(right));
                self.compile_node(l);
                self.push(Op::Jump(end));
                // Only reachable by backtracking, which has already restored
                // the cursor.
                self.push(Op::Label(right));
                self.compile_node(r);
                self.push(Op::Label(end));
            }
            Regex::Repeat(body) => {
                self.loop_depth += 1;
                if body.can_match_empty() {
                    self.compile_guarded_repeat(body);
                } else {
                    self.compile_repeat(body);
                }
                self.loop_depth -= 1;
            }
            Regex::LineStart => {
                self.push(Op::CmpLineStart);
                self.push(Op::JumpIfNe(self.backtrack));
            }
            Regex::LineEnd => {
                self.push(Op::CmpByte(0));
                self.push(Op::JumpIfNe(self.backtrack));
            }
            Regex::Empty => {}
        }
    }

    fn compile_repeat(&mut self, body: &Regex) {
        let top = self.label();
        let exit = self.label();
        self.pushes(CHOICE_POINT);
        self.push(Op::Label(top));
        self.push(Op::PushChoice(exit));
        self.compile_node(body);
        self.push(Op::Jump(top));
        self.push(Op::Label(exit));
    }

    // A body that can succeed without consuming input would make the plain
    // loop spin forever, pushing a choice point per turn. The iteration's
    // start cursor is kept in a frame slot, and an iteration that did not
    // move the cursor leaves the loop instead of starting another one.
    //
    // The slot's previous value is pushed beneath the loop's choice point and
    // popped back when that choice point is taken, so backtracking into an
    // earlier iteration sees that iteration's start again.
    fn compile_guarded_repeat(&mut self, body: &Regex) {
        let slot = self.next_slot;
        self.next_slot += 1;

        let top = self.label();
        let exit = self.label();
        let done = self.label();
        self.pushes(SLOT + CHOICE_POINT);
        self.push(Op::Label(top));
        self.push(Op::SaveSlot(slot));
        self.push(Op::PushChoice(exit));
        self.push(Op::StoreCursor(slot));
        self.compile_node(body);
        self.push(Op::CmpCursorSlot(slot));
        self.push(Op::JumpIfNe(top));
        self.push(Op::Jump(done));
        self.push(Op::Label(exit));
        self.push(Op::RestoreSlot(slot));
        self.push(Op::Label(done));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(pattern: &str) -> Program {
        let regex = Regex::parse(pattern).unwrap();
        compile(regex.as_ref())
    }

    fn listing(pattern: &str) -> Vec<String> {
        program(pattern)
            .listing()
            .lines()
            .map(|line| line.trim().to_string())
            .collect()
    }

    #[test]
    fn test_compile_empty_pattern() {
        assert_eq!(
            listing(""),
            vec![
                "push rbp; mov rbp, rsp",
                "lea rax, [rip + .L2]; push rax; push rdi",
                "mov eax, 1; mov rsp, rbp; pop rbp; ret",
                ".L1:",
                "pop rdi; ret",
                ".L2:",
                "xor eax, eax; mov rsp, rbp; pop rbp; ret",
            ]
        );
    }

    #[test]
    fn test_compile_literal_and_anchors() {
        assert_eq!(
            listing("^a$")[2..8],
            [
                "cmp rdi, rsi",
                "jne .L1",
                "cmp byte ptr [rdi], 0x61",
                "jne .L1",
                "inc rdi",
                "cmp byte ptr [rdi], 0x00",
            ]
        );
    }

    #[test]
    fn test_compile_wildcard() {
        assert_eq!(
            listing(".")[2..5],
            ["cmp byte ptr [rdi], 0x00", "je .L1", "inc rdi"]
        );
    }

    #[test]
    fn test_compile_choice() {
        assert_eq!(
            listing("a|b")[2..12],
            [
                "lea rax, [rip + .L3]; push rax; push rdi",
                "cmp byte ptr [rdi], 0x61",
                "jne .L1",
                "inc rdi",
                "jmp .L4",
                ".L3:",
                "cmp byte ptr [rdi], 0x62",
                "jne .L1",
                "inc rdi",
                ".L4:",
            ]
        );
    }

    #[test]
    fn test_compile_repeat() {
        assert_eq!(
            listing("a*")[2..9],
            [
                ".L3:",
                "lea rax, [rip + .L4]; push rax; push rdi",
                "cmp byte ptr [rdi], 0x61",
                "jne .L1",
                "inc rdi",
                "jmp .L3",
                ".L4:",
            ]
        );
    }

    #[test]
    fn test_compile_guarded_repeat() {
        let program = program("(a|)*");
        assert_eq!(program.slots, 1);
        let listing: Vec<String> = program
            .listing()
            .lines()
            .map(|line| line.trim().to_string())
            .collect();
        assert_eq!(listing[0], "push rbp; mov rbp, rsp; sub rsp, 8");
        assert_eq!(
            listing[2..6],
            [
                ".L3:",
                "push qword ptr [rbp - 8]",
                "lea rax, [rip + .L4]; push rax; push rdi",
                "mov qword ptr [rbp - 8], rdi",
            ]
        );
        let tail = &listing[listing.len() - 11..listing.len() - 4];
        assert_eq!(
            tail,
            [
                "cmp rdi, qword ptr [rbp - 8]",
                "jne .L3",
                "jmp .L5",
                ".L4:",
                "pop qword ptr [rbp - 8]",
                ".L5:",
                "mov eax, 1; mov rsp, rbp; pop rbp; ret",
            ]
        );
    }

    #[test]
    fn test_guarded_loop_count() {
        assert_eq!(program("a*").slots, 0);
        assert_eq!(program("(ab)*").slots, 0);
        assert_eq!(program("(a*)*").slots, 1);
        assert_eq!(program("((a|)*b)*").slots, 1);
        assert_eq!(program("((a*)*)*").slots, 2);
        assert_eq!(program("(^)*($)*").slots, 2);
    }

    #[test]
    fn test_stack_use() {
        // return address, saved rbp, sentinel
        assert_eq!(program("").stack, StackUse { fixed: 32, per_byte: 0 });
        assert_eq!(program("abc").stack, StackUse { fixed: 32, per_byte: 0 });
        assert_eq!(program("a|b").stack, StackUse { fixed: 48, per_byte: 0 });
        assert_eq!(program("a*b").stack, StackUse { fixed: 32, per_byte: 16 });
        assert_eq!(program("(a|b)*").stack, StackUse { fixed: 32, per_byte: 32 });
        assert_eq!(program("(ab*)*").stack, StackUse { fixed: 32, per_byte: 48 });
        // One slot in the frame, plus a saved copy per iteration.
        assert_eq!(program("(a*)*").stack, StackUse { fixed: 40, per_byte: 56 });

        let stack = program("a*b").stack;
        assert_eq!(stack.bound(0), 48);
        assert_eq!(stack.bound(1_000_000), 32 + 16 * 1_000_001);
        assert_eq!(stack.bound(usize::MAX), usize::MAX);
    }

    #[test]
    fn test_compile_is_deterministic() {
        for pattern in ["", "abc", "a|b|c", "(a*b)*c", "^(.|x)*$", "((a|)*)*"] {
            let first = program(pattern);
            let second = program(pattern);
            assert_eq!(first.code, second.code, "{}", pattern);
            assert_eq!(first.ops, second.ops, "{}", pattern);
        }
    }
}

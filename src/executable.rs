//! Executable memory for generated code, and the matcher that runs it.

use std::ffi::CStr;
use std::fmt;
use std::io;
use std::path::Path;
use std::ptr::NonNull;

use crate::compiler::{self, StackUse};
use crate::error::{Error, Result};
use crate::regex::Regex;

/// A private, page-aligned mapping holding a copy of some machine code.
///
/// The mapping is writable only while the code is copied in; from then on it
/// is read + execute until it is unmapped on drop.
pub struct ExecutableRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The region is never written after construction.
unsafe impl Send for ExecutableRegion {}
unsafe impl Sync for ExecutableRegion {}

impl ExecutableRegion {
    pub fn new(code: &[u8]) -> Result<ExecutableRegion> {
        if code.is_empty() {
            return Err(Error::Platform(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty code region",
            )));
        }
        let len = code.len();
        unsafe {
            let ptr = sys::map_writable(len).map_err(Error::Platform)?;
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr.as_ptr(), len);
            if let Err(err) = sys::make_executable(ptr, len) {
                sys::unmap(ptr, len);
                return Err(Error::Platform(err));
            }
            log::debug!("mapped {} bytes of code at {:p}", len, ptr);
            Ok(ExecutableRegion { ptr, len })
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        log::debug!("unmapping {} bytes of code at {:p}", self.len, self.ptr);
        unsafe { sys::unmap(self.ptr, self.len) };
    }
}

#[cfg(unix)]
mod sys {
    use std::io;
    use std::ptr::{self, NonNull};

    pub unsafe fn map_writable(len: usize) -> io::Result<NonNull<u8>> {
        let ptr = libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    pub unsafe fn make_executable(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        if libc::mprotect(ptr.as_ptr().cast(), len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
        if libc::munmap(ptr.as_ptr().cast(), len) != 0 {
            log::warn!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use std::io;
    use std::ptr::NonNull;

    pub unsafe fn map_writable(_len: usize) -> io::Result<NonNull<u8>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "executable memory is only implemented for unix hosts",
        ))
    }

    pub unsafe fn make_executable(_ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        unreachable!()
    }

    pub unsafe fn unmap(_ptr: NonNull<u8>, _len: usize) {}
}

#[cfg(target_arch = "x86_64")]
type MatchFn = unsafe extern "sysv64" fn(cursor: *const u8, line_start: *const u8) -> bool;
#[cfg(not(target_arch = "x86_64"))]
type MatchFn = unsafe extern "C" fn(cursor: *const u8, line_start: *const u8) -> bool;

/// A compiled pattern, ready to run.
///
/// The generated code only reads its own bytes and the line it is given, and
/// keeps all backtracking state on the calling thread's stack, so one
/// `Matcher` can be shared freely between threads.
pub struct Matcher {
    region: ExecutableRegion,
    entry: MatchFn,
    stack: StackUse,
}

impl Matcher {
    /// Parses and compiles `pattern`.
    pub fn compile(pattern: &str) -> Result<Matcher> {
        let regex = Regex::parse(pattern)?;
        let program = compiler::compile(regex.as_ref());
        log::debug!("pattern {:?} compiled to {} bytes", pattern, program.code.len());
        // SAFETY: the compiler only produces code that follows the matcher
        // calling convention and reads no further than the line terminator.
        let mut matcher = unsafe { Matcher::from_code(&program.code) }?;
        matcher.stack = program.stack;
        Ok(matcher)
    }

    /// Maps `code` as a matcher.
    ///
    /// # Safety
    ///
    /// `code` must be a complete x86-64 function taking the cursor in `rdi`
    /// and the line start in `rsi`, returning a bool in `al`, preserving
    /// `rbp` and `rsp`, and never reading past the line's NUL terminator.
    /// Its stack use is unknown, so `stack_bound` reports zero.
    pub unsafe fn from_code(code: &[u8]) -> Result<Matcher> {
        if !cfg!(target_arch = "x86_64") {
            return Err(Error::Platform(io::Error::new(
                io::ErrorKind::Unsupported,
                "generated code targets x86-64",
            )));
        }
        let region = ExecutableRegion::new(code)?;
        let entry = std::mem::transmute::<*const u8, MatchFn>(region.as_ptr());
        Ok(Matcher {
            region,
            entry,
            stack: StackUse::default(),
        })
    }

    /// Runs the matcher with `cursor` at the position to try and
    /// `line_start` at the beginning of the line.
    ///
    /// # Safety
    ///
    /// Both pointers must point into the same NUL-terminated line, with
    /// `line_start <= cursor <= terminator`.
    pub unsafe fn call(&self, cursor: *const u8, line_start: *const u8) -> bool {
        (self.entry)(cursor, line_start)
    }

    /// Whether the pattern matches `line` starting exactly at byte `offset`.
    ///
    /// Panics if `offset` is past the end of the line. The end itself, where
    /// only empty matches are possible, is a valid offset.
    pub fn matches_at(&self, line: &CStr, offset: usize) -> bool {
        let bytes = line.to_bytes_with_nul();
        assert!(
            offset < bytes.len(),
            "offset {} past end of line of length {}",
            offset,
            bytes.len() - 1
        );
        let start = bytes.as_ptr();
        unsafe { self.call(start.add(offset), start) }
    }

    /// Whether the pattern matches anywhere in `line`, trying each start
    /// offset from left to right.
    pub fn is_match(&self, line: &CStr) -> bool {
        (0..=line.to_bytes().len()).any(|offset| self.matches_at(line, offset))
    }

    /// Upper bound, in bytes, on the native stack one call uses on a line of
    /// `line_len` bytes. Callers matching long lines must run on a stack at
    /// least this large.
    pub fn stack_bound(&self, line_len: usize) -> usize {
        self.stack.bound(line_len)
    }

    /// The generated machine code, as mapped.
    pub fn code(&self) -> &[u8] {
        self.region.as_slice()
    }

    /// Writes the generated machine code to `path` for offline inspection,
    /// e.g. with `objdump -D -b binary -m i386:x86-64`.
    pub fn dump_code(&self, path: impl AsRef<Path>) -> io::Result<()> {
        std::fs::write(path, self.code())
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("code", &self.region.as_ptr())
            .field("len", &self.region.len)
            .field("stack", &self.stack)
            .finish()
    }
}

// This program translates classical regular expressions into x86-64 machine
// code: a backtracking matcher that keeps its choice points on the native
// stack, so that failing is just `pop rdi; ret`.

pub mod code_buffer;
pub mod compiler;
pub mod error;
pub mod executable;
pub mod linear_collections;
pub mod machine;
pub mod regex;
pub mod scan;

pub use error::{Error, Result, SyntaxError, SyntaxErrorKind};
pub use executable::Matcher;
pub use regex::Regex;
pub use scan::{ScanOptions, ScanSummary, Scanner};

/// Parses `pattern` and compiles it to a ready-to-run matcher.
pub fn compile(pattern: &str) -> Result<Matcher> {
    Matcher::compile(pattern)
}

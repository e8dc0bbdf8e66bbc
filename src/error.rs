use std::fmt;
use std::io;

/// Everything that can go wrong while turning a pattern into a runnable
/// matcher. Matching itself cannot fail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    /// The host refused to hand out executable memory.
    #[error("cannot map executable memory")]
    Platform(#[source] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A pattern that could not be parsed. `pos` is a byte offset into the
/// pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("syntax error at offset {pos}: {kind}")]
pub struct SyntaxError {
    pub pos: usize,
    pub kind: SyntaxErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxErrorKind {
    /// `*` with no operand, e.g. `*a` or `a|*`.
    NothingToRepeat,
    /// `(` without a matching `)`.
    UnclosedGroup,
    /// A `\` at the very end of the pattern.
    TrailingEscape,
    /// Input left over after a complete expression, e.g. a stray `)`.
    UnexpectedChar(char),
    /// NUL is the line terminator and can never be matched literally.
    NulByte,
}

impl SyntaxError {
    pub fn new(pos: usize, kind: SyntaxErrorKind) -> Self {
        Self { pos, kind }
    }
}

impl fmt::Display for SyntaxErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyntaxErrorKind::NothingToRepeat => f.write_str("nothing to repeat before `*`"),
            SyntaxErrorKind::UnclosedGroup => f.write_str("unclosed group, expected `)`"),
            SyntaxErrorKind::TrailingEscape => f.write_str("trailing backslash"),
            SyntaxErrorKind::UnexpectedChar(c) => write!(f, "unexpected `{}`", c.escape_default()),
            SyntaxErrorKind::NulByte => f.write_str("NUL byte in pattern"),
        }
    }
}

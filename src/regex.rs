use crate::error::{SyntaxError, SyntaxErrorKind};

/// A `Regex` is a classical regular expression over bytes.
///
/// Every composite node owns its children, so a parsed pattern is a plain
/// tree with no sharing.
#[derive(PartialEq, Eq, Debug)]
pub enum Regex {
    /// A single byte. Never NUL, which is reserved as the line terminator.
    Literal(u8),
    /// `.`, any byte except the terminator.
    Any,
    Concat(Box<Regex>, Box<Regex>),
    /// `l|r`. The left branch is always tried first.
    Choice(Box<Regex>, Box<Regex>),
    /// Greedy, unbounded `*`.
    Repeat(Box<Regex>),
    /// `^`
    LineStart,
    /// `$`
    LineEnd,
    /// An empty alternative such as the right side of `a|`. Matches without
    /// consuming anything.
    Empty,
}

impl Regex {
    /// Parses classical regex notation.
    ///
    /// Grammar, lowest precedence first:
    ///
    /// ```text
    /// <or>      ::= <concat> ('|' <concat>)*
    /// <concat>  ::= <star>*
    /// <star>    ::= <primary> '*'*
    /// <primary> ::= '(' <or> ')' | '.' | '^' | '$' | '\' <any byte> | <literal byte>
    /// ```
    ///
    /// An empty pattern parses to `None`, which matches the empty string at
    /// every position.
    pub fn parse(pattern: &str) -> Result<Option<Regex>, SyntaxError> {
        let mut parser = Parser {
            pattern: pattern.as_bytes(),
            pos: 0,
        };
        let regex = parser.parse_or()?;

        // The only thing that can stop `parse_or` early is a `)` with no
        // group to close.
        if parser.pos < pattern.len() {
            let c = pattern[parser.pos..].chars().next().unwrap_or_default();
            return Err(SyntaxError::new(
                parser.pos,
                SyntaxErrorKind::UnexpectedChar(c),
            ));
        }
        Ok(regex)
    }

    /// Whether this node can succeed without consuming any input.
    pub fn can_match_empty(&self) -> bool {
        match self {
            Regex::Literal(_) | Regex::Any => false,
            Regex::LineStart | Regex::LineEnd | Regex::Empty | Regex::Repeat(_) => true,
            Regex::Concat(l, r) => l.can_match_empty() && r.can_match_empty(),
            Regex::Choice(l, r) => l.can_match_empty() || r.can_match_empty(),
        }
    }

    /// Interprets `root` against `line`, anchored at byte offset `at`.
    ///
    /// This is a straightforward backtracking matcher with exactly the
    /// semantics of the generated code: alternatives are tried left to right,
    /// repetition is greedy and gives back one iteration at a time, and a
    /// repetition whose body matched without consuming input stops iterating.
    /// The end of `line`, or an embedded NUL, is the end of the line.
    pub fn interpret(root: Option<&Regex>, line: &[u8], at: usize) -> bool {
        assert!(at <= line.len(), "offset {} past end of line", at);
        match root {
            None => true,
            Some(regex) => regex.step(line, at, &mut |_| true),
        }
    }

    // Matches `self` at `at` and hands every possible end position to `k`, in
    // priority order, until `k` accepts one.
    fn step(&self, line: &[u8], at: usize, k: &mut dyn FnMut(usize) -> bool) -> bool {
        let byte = line.get(at).copied().unwrap_or(0);
        match self {
            Regex::Literal(c) => byte == *c && k(at + 1),
            Regex::Any => byte != 0 && k(at + 1),
            Regex::LineStart => at == 0 && k(at),
            Regex::LineEnd => byte == 0 && k(at),
            Regex::Empty => k(at),
            Regex::Concat(l, r) => l.step(line, at, &mut |next| r.step(line, next, k)),
            Regex::Choice(l, r) => l.step(line, at, k) || r.step(line, at, k),
            Regex::Repeat(body) => {
                let repeated = body.step(line, at, &mut |next| {
                    if next == at {
                        k(next)
                    } else {
                        self.step(line, next, k)
                    }
                });
                repeated || k(at)
            }
        }
    }
}

/// Single pass, one byte of lookahead, no backtracking.
struct Parser<'a> {
    pattern: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.pattern.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn parse_or(&mut self) -> Result<Option<Regex>, SyntaxError> {
        let mut regex = self.parse_concat()?;
        while self.peek() == Some(b'|') {
            self.pos += 1;
            let right = self.parse_concat()?;
            regex = Some(Regex::Choice(
                Box::new(regex.unwrap_or(Regex::Empty)),
                Box::new(right.unwrap_or(Regex::Empty)),
            ));
        }
        Ok(regex)
    }

    fn parse_concat(&mut self) -> Result<Option<Regex>, SyntaxError> {
        let mut regex = None;
        while let Some(c) = self.peek() {
            if c == b'|' || c == b')' {
                break;
            }
            regex = match (regex, self.parse_star()?) {
                (None, next) => next,
                (Some(prev), None) => Some(prev),
                (Some(prev), Some(next)) => Some(Regex::Concat(Box::new(prev), Box::new(next))),
            };
        }
        Ok(regex)
    }

    fn parse_star(&mut self) -> Result<Option<Regex>, SyntaxError> {
        let mut regex = self.parse_primary()?;
        while self.peek() == Some(b'*') {
            let star = self.pos;
            self.pos += 1;
            let operand =
                regex.ok_or_else(|| SyntaxError::new(star, SyntaxErrorKind::NothingToRepeat))?;
            regex = Some(Regex::Repeat(Box::new(operand)));
        }
        Ok(regex)
    }

    fn parse_primary(&mut self) -> Result<Option<Regex>, SyntaxError> {
        let start = self.pos;
        let c = match self.peek() {
            // Operators belong to the callers. A `*` here has no operand,
            // which `parse_star` reports.
            None | Some(b'*') | Some(b'|') | Some(b')') => return Ok(None),
            Some(c) => c,
        };
        self.pos += 1;

        let regex = match c {
            b'(' => {
                let inner = self.parse_or()?;
                if self.bump() != Some(b')') {
                    return Err(SyntaxError::new(start, SyntaxErrorKind::UnclosedGroup));
                }
                return Ok(inner);
            }
            b'.' => Regex::Any,
            b'^' => Regex::LineStart,
            b'$' => Regex::LineEnd,
            b'\\' => match self.bump() {
                None => return Err(SyntaxError::new(start, SyntaxErrorKind::TrailingEscape)),
                Some(0) => return Err(SyntaxError::new(start + 1, SyntaxErrorKind::NulByte)),
                Some(escaped) => Regex::Literal(escaped),
            },
            0 => return Err(SyntaxError::new(start, SyntaxErrorKind::NulByte)),
            _ => Regex::Literal(c),
        };
        Ok(Some(regex))
    }
}

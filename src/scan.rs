//! Line-by-line scanning, grep style.

use std::ffi::CStr;
use std::io::{self, BufRead, Write};

use crate::executable::Matcher;

#[derive(Clone, Copy, Debug, Default)]
pub struct ScanOptions {
    /// Print only the number of matching lines.
    pub count: bool,
    /// Prefix printed lines with their 1-based line number.
    pub line_number: bool,
    /// Print nothing and stop at the first matching line.
    pub quiet: bool,
    /// Prefix output with the input's name.
    pub with_filename: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Lines read, including the matching one `quiet` stopped at.
    pub lines: u64,
    pub matched: u64,
}

/// Runs a matcher over lines of input.
pub struct Scanner<'m> {
    matcher: &'m Matcher,
    options: ScanOptions,
    // Native stack the matcher may use per line; unchecked if `None`.
    stack_budget: Option<usize>,
    // NUL-terminated copy of the current line.
    line: Vec<u8>,
}

impl<'m> Scanner<'m> {
    pub fn new(matcher: &'m Matcher, options: ScanOptions) -> Scanner<'m> {
        Scanner {
            matcher,
            options,
            stack_budget: None,
            line: Vec::new(),
        }
    }

    /// Refuses lines the matcher could need more than `bytes` of stack
    /// for. `scan` then fails with `InvalidData` instead of overflowing the
    /// calling thread's stack.
    pub fn with_stack_budget(mut self, bytes: usize) -> Scanner<'m> {
        self.stack_budget = Some(bytes);
        self
    }

    fn check_stack(&self, line_number: u64, line: &[u8]) -> io::Result<()> {
        let Some(budget) = self.stack_budget else {
            return Ok(());
        };
        let needed = self.matcher.stack_bound(line.len());
        if needed > budget {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "line {} is too long to match ({} bytes, needs up to {} bytes of stack, limit {})",
                    line_number,
                    line.len(),
                    needed,
                    budget
                ),
            ));
        }
        Ok(())
    }

    /// Whether `line`, without its newline, contains a match.
    ///
    /// NUL is the matcher's only end-of-line signal, so a line with an
    /// embedded NUL is matched as if it ended there.
    pub fn line_matches(&mut self, line: &[u8]) -> bool {
        self.line.clear();
        self.line.extend_from_slice(line);
        self.line.push(0);
        match CStr::from_bytes_until_nul(&self.line) {
            Ok(line) => self.matcher.is_match(line),
            Err(_) => unreachable!("line buffer is always NUL-terminated"),
        }
    }

    /// Reads `input` to the end (or to the first match when quiet) and
    /// writes matching lines, or their count, to `out`.
    pub fn scan<R: BufRead, W: Write>(
        &mut self,
        name: &str,
        mut input: R,
        out: &mut W,
    ) -> io::Result<ScanSummary> {
        let mut summary = ScanSummary::default();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if input.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            let line = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
            summary.lines += 1;

            self.check_stack(summary.lines, line)?;
            if !self.line_matches(line) {
                continue;
            }
            summary.matched += 1;
            if self.options.quiet {
                break;
            }
            if self.options.count {
                continue;
            }
            if self.options.with_filename {
                write!(out, "{}:", name)?;
            }
            if self.options.line_number {
                write!(out, "{}:", summary.lines)?;
            }
            out.write_all(line)?;
            out.write_all(b"\n")?;
        }

        if self.options.count && !self.options.quiet {
            if self.options.with_filename {
                write!(out, "{}:", name)?;
            }
            writeln!(out, "{}", summary.matched)?;
        }
        log::debug!(
            "{}: {} of {} line(s) matched",
            name,
            summary.matched,
            summary.lines
        );
        Ok(summary)
    }
}

#[cfg(all(test, target_arch = "x86_64", unix))]
mod tests {
    use super::*;

    fn grep(pattern: &str, input: &str, options: ScanOptions) -> (String, ScanSummary) {
        let matcher = Matcher::compile(pattern).unwrap();
        let mut scanner = Scanner::new(&matcher, options);
        let mut out = Vec::new();
        let summary = scanner.scan("input", input.as_bytes(), &mut out).unwrap();
        (String::from_utf8(out).unwrap(), summary)
    }

    #[test]
    fn test_scan_prints_matching_lines() {
        let (out, summary) = grep("o.r", "foobar\nfour\nbaz\nour\n", ScanOptions::default());
        assert_eq!(out, "four\nour\n");
        assert_eq!(summary, ScanSummary { lines: 4, matched: 2 });
    }

    #[test]
    fn test_scan_last_line_without_newline() {
        let (out, summary) = grep("b", "a\nb", ScanOptions::default());
        assert_eq!(out, "b\n");
        assert_eq!(summary, ScanSummary { lines: 2, matched: 1 });
    }

    #[test]
    fn test_scan_empty_pattern_matches_empty_lines() {
        let (out, summary) = grep("", "\n\nx\n", ScanOptions::default());
        assert_eq!(out, "\n\nx\n");
        assert_eq!(summary.matched, 3);
    }

    #[test]
    fn test_scan_anchors_per_line() {
        let (out, _) = grep("^ab$", "ab\nxab\nabx\nab\n", ScanOptions::default());
        assert_eq!(out, "ab\nab\n");
    }

    #[test]
    fn test_scan_keeps_carriage_return() {
        // Only `\n` ends a line; a trailing `\r` is an ordinary byte.
        let (out, _) = grep("a$", "a\r\nba\n", ScanOptions::default());
        assert_eq!(out, "ba\n");
        let (out, _) = grep("a.$", "a\r\n", ScanOptions::default());
        assert_eq!(out, "a\r\n");
    }

    #[test]
    fn test_scan_embedded_nul_ends_line() {
        let (out, _) = grep("ab", "a\0b\nab\0\n", ScanOptions::default());
        assert_eq!(out, "ab\0\n");
    }

    #[test]
    fn test_scan_count_and_line_numbers() {
        let count = ScanOptions {
            count: true,
            ..ScanOptions::default()
        };
        let (out, _) = grep("a", "a\nb\na\n", count);
        assert_eq!(out, "2\n");

        let numbered = ScanOptions {
            line_number: true,
            with_filename: true,
            ..ScanOptions::default()
        };
        let (out, _) = grep("a", "a\nb\na\n", numbered);
        assert_eq!(out, "input:1:a\ninput:3:a\n");
    }

    #[test]
    fn test_scan_quiet_stops_early() {
        let quiet = ScanOptions {
            quiet: true,
            count: true,
            ..ScanOptions::default()
        };
        let (out, summary) = grep("b", "a\nb\nb\nc\n", quiet);
        assert_eq!(out, "");
        assert_eq!(summary, ScanSummary { lines: 2, matched: 1 });
    }

    #[test]
    fn test_scan_megabyte_line() {
        let matcher = Matcher::compile("^a*b").unwrap();
        let mut input = vec![b'a'; 1 << 20];
        input.extend_from_slice(b"\nab\n");
        let stack = 64 << 20;

        let mut out = Vec::new();
        let summary = std::thread::scope(|s| {
            std::thread::Builder::new()
                .stack_size(stack)
                .spawn_scoped(s, || {
                    let mut scanner = Scanner::new(&matcher, ScanOptions::default())
                        .with_stack_budget(stack - (1 << 20));
                    scanner.scan("input", &input[..], &mut out)
                })
                .unwrap()
                .join()
                .unwrap()
        })
        .unwrap();
        assert_eq!(summary, ScanSummary { lines: 2, matched: 1 });
        assert_eq!(out, b"ab\n");
    }

    #[test]
    fn test_scan_rejects_line_over_stack_budget() {
        let matcher = Matcher::compile("a*b").unwrap();
        let budget = matcher.stack_bound(100);
        let mut scanner = Scanner::new(&matcher, ScanOptions::default()).with_stack_budget(budget);

        let mut out = Vec::new();
        let input = format!("ab\n{}\n", "a".repeat(101));
        let err = scanner.scan("input", input.as_bytes(), &mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().starts_with("line 2 is too long"), "{}", err);
        // Lines before the long one were still reported.
        assert_eq!(out, b"ab\n");

        let input = format!("{}b\n", "a".repeat(99));
        let summary = scanner.scan("input", input.as_bytes(), &mut out).unwrap();
        assert_eq!(summary.matched, 1);
    }

    #[test]
    fn test_line_matches_reuses_buffer() {
        let matcher = Matcher::compile("a.b").unwrap();
        let mut scanner = Scanner::new(&matcher, ScanOptions::default());
        assert!(scanner.line_matches(b"xxaxb"));
        // A shorter line must not see leftovers from the previous one.
        assert!(!scanner.line_matches(b"a"));
        assert!(!scanner.line_matches(b""));
    }
}

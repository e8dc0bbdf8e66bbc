// jitgrep: print the lines of each input that match a pattern. The pattern is
// compiled straight to x86-64 machine code before the first line is read.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;

use annotate_snippets::{AnnotationKind, Group, Level, Renderer, Snippet};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use jitgrep::{Error, Matcher, ScanOptions, Scanner, SyntaxError};

const DEFAULT_DUMP_PATH: &str = "jit_dump.bin";

/// Stack of the scanning thread. Choice points live on it, so it bounds the
/// longest line that can be matched.
const SCAN_STACK_SIZE: usize = 256 << 20;
/// Part of the scanning thread's stack kept for everything but the matcher.
const SCAN_STACK_RESERVE: usize = 1 << 20;

fn pattern_arg() -> Arg {
    Arg::new("pattern")
        .value_name("PATTERN")
        .required(true)
        .help("Regular expression: literals, ., ^, $, *, |, (...) and \\ escapes")
}

fn files_arg() -> Arg {
    Arg::new("files")
        .value_name("FILE")
        .num_args(0..)
        .value_parser(value_parser!(PathBuf))
        .help("Files to search; standard input if none or `-`")
}

fn count_arg() -> Arg {
    Arg::new("count")
        .short('c')
        .long("count")
        .action(ArgAction::SetTrue)
        .help("Print only a count of matching lines per input")
}

fn line_number_arg() -> Arg {
    Arg::new("line_number")
        .short('n')
        .long("line-number")
        .action(ArgAction::SetTrue)
        .help("Prefix each matching line with its line number")
}

fn quiet_arg() -> Arg {
    Arg::new("quiet")
        .short('q')
        .long("quiet")
        .action(ArgAction::SetTrue)
        .help("Print nothing; exit on the first match")
}

fn with_filename_arg() -> Arg {
    Arg::new("with_filename")
        .short('H')
        .long("with-filename")
        .action(ArgAction::SetTrue)
        .help("Prefix output with the file name (default with several files)")
}

fn dump_code_arg() -> Arg {
    Arg::new("dump_code")
        .long("dump-code")
        .value_name("PATH")
        .num_args(0..=1)
        .default_missing_value(DEFAULT_DUMP_PATH)
        .value_parser(value_parser!(PathBuf))
        .help("Write the generated machine code to PATH (default: jit_dump.bin)")
}

fn log_level_arg() -> Arg {
    Arg::new("log_level")
        .long("log-level")
        .value_name("LEVEL")
        .default_value("warn")
        .value_parser(["off", "error", "warn", "info", "debug", "trace"])
        .help("Diagnostics written to stderr")
}

fn cli() -> Command {
    Command::new("jitgrep")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Search lines with a JIT-compiled regular expression")
        .arg(pattern_arg())
        .arg(files_arg())
        .arg(count_arg())
        .arg(line_number_arg())
        .arg(quiet_arg())
        .arg(with_filename_arg())
        .arg(dump_code_arg())
        .arg(log_level_arg())
}

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "jitgrep: {}: {}",
                record.level().as_str().to_ascii_lowercase(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(level: log::LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Renders a pattern syntax error with a caret under the offending byte.
fn render_syntax_error(pattern: &str, err: &SyntaxError) -> String {
    let start = err.pos.min(pattern.len());
    let end = pattern
        .get(start..)
        .and_then(|rest| rest.chars().next())
        .map_or(start, |c| start + c.len_utf8());
    let message = err.kind.to_string();

    let snippet = Snippet::source(pattern)
        .line_start(1)
        .annotation(AnnotationKind::Primary.span(start..end).label(&message));
    let report: Vec<Group> = vec![Level::ERROR
        .primary_title(format!("invalid pattern: {}", message))
        .element(snippet)];

    Renderer::plain().render(&report).to_string()
}

fn open(path: &Path) -> io::Result<Box<dyn io::BufRead>> {
    if path == Path::new("-") {
        return Ok(Box::new(io::stdin().lock()));
    }
    Ok(Box::new(BufReader::new(File::open(path)?)))
}

/// Returns whether any line matched, or `None` if some input could not be
/// read.
fn run(matches: &ArgMatches) -> Result<Option<bool>, Error> {
    let pattern = matches
        .get_one::<String>("pattern")
        .expect("pattern is required");
    let mut files: Vec<PathBuf> = matches
        .get_many::<PathBuf>("files")
        .map(|files| files.cloned().collect())
        .unwrap_or_default();
    if files.is_empty() {
        files.push(PathBuf::from("-"));
    }

    let matcher = match Matcher::compile(pattern) {
        Ok(matcher) => matcher,
        Err(Error::Syntax(err)) => {
            eprintln!("{}", render_syntax_error(pattern, &err));
            return Err(Error::Syntax(err));
        }
        Err(err) => return Err(err),
    };

    if let Some(path) = matches.get_one::<PathBuf>("dump_code") {
        match matcher.dump_code(path) {
            Ok(()) => log::info!("wrote {} bytes of code to {}", matcher.code().len(), path.display()),
            Err(err) => log::warn!("cannot write {}: {}", path.display(), err),
        }
    }

    let options = ScanOptions {
        count: matches.get_flag("count"),
        line_number: matches.get_flag("line_number"),
        quiet: matches.get_flag("quiet"),
        with_filename: matches.get_flag("with_filename") || files.len() > 1,
    };

    let scanned = thread::scope(|s| -> io::Result<Option<bool>> {
        let worker = thread::Builder::new()
            .name("scan".to_string())
            .stack_size(SCAN_STACK_SIZE)
            .spawn_scoped(s, || scan_files(&matcher, options, &files))?;
        match worker.join() {
            Ok(result) => Ok(result),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    });
    match scanned {
        Ok(result) => Ok(result),
        Err(err) => {
            eprintln!("jitgrep: cannot start scanning thread: {}", err);
            Ok(None)
        }
    }
}

/// Scans every input in turn. Returns whether any line matched, or `None`
/// if some input could not be read.
fn scan_files(matcher: &Matcher, options: ScanOptions, files: &[PathBuf]) -> Option<bool> {
    let mut scanner = Scanner::new(matcher, options)
        .with_stack_budget(SCAN_STACK_SIZE - SCAN_STACK_RESERVE);
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    let mut any_matched = false;
    let mut had_error = false;
    for path in files {
        let name = if path == Path::new("-") {
            "(standard input)".to_string()
        } else {
            path.display().to_string()
        };
        let summary = open(path).and_then(|input| scanner.scan(&name, input, &mut out));
        match summary {
            Ok(summary) => {
                any_matched |= summary.matched > 0;
                if options.quiet && any_matched {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => break,
            Err(err) => {
                eprintln!("jitgrep: {}: {}", name, err);
                had_error = true;
            }
        }
    }

    if let Err(err) = out.flush() {
        if err.kind() != io::ErrorKind::BrokenPipe {
            eprintln!("jitgrep: {}", err);
            had_error = true;
        }
    }

    // grep reports a match over an error only when quiet.
    if had_error && !(options.quiet && any_matched) {
        return None;
    }
    Some(any_matched)
}

fn main() -> ExitCode {
    let matches = cli().get_matches();
    let level = matches
        .get_one::<String>("log_level")
        .and_then(|level| level.parse().ok())
        .unwrap_or(log::LevelFilter::Warn);
    init_logging(level);

    match run(&matches) {
        Ok(Some(true)) => ExitCode::SUCCESS,
        Ok(Some(false)) => ExitCode::from(1),
        Ok(None) => ExitCode::from(2),
        Err(Error::Syntax(_)) => ExitCode::from(2),
        Err(err) => {
            eprintln!("jitgrep: {}", report(&err));
            ExitCode::from(2)
        }
    }
}

/// `err` followed by its chain of sources.
fn report(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}

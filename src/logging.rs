//! Log output
//!
//! Records carry a timestamp, the level, an optional prefix taken from the
//! outermost span (the worker thread runs inside a `worker` span) and the
//! message. On a terminal the level and message are coloured.

use std::fmt;
use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const RESET: &str = "\x1b[0m";

/// Re-emit the reset sequence before every embedded newline so that a coloured
/// multi-line message never bleeds into the next line's prefix
pub fn reset_before_newlines(rendered: &str) -> String {
    let mut out = String::with_capacity(rendered.len() + 8);
    for (i, line) in rendered.split('\n').enumerate() {
        if i > 0 {
            out.push_str(RESET);
            out.push('\n');
        }
        out.push_str(line);
    }
    out
}

/// Log verbosity as accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verbosity(pub Level);

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity(Level::INFO)
    }
}

impl FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = match s.trim().to_ascii_lowercase().as_str() {
            "0" | "debug" => Level::DEBUG,
            "1" | "info" => Level::INFO,
            "2" | "warning" | "warn" => Level::WARN,
            "3" | "error" => Level::ERROR,
            _ => return Err(format!("invalid verbosity '{}' (expected debug, info, warning, error or 0-3)", s)),
        };
        Ok(Verbosity(level))
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            Level::TRACE | Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warning",
            Level::ERROR => "error",
        };
        f.write_str(name)
    }
}

fn color(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "\x1b[1;31m",
        Level::WARN => "\x1b[33m",
        Level::INFO => "\x1b[32m",
        Level::DEBUG | Level::TRACE => "\x1b[2m",
    }
}

struct RecordFormat {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for RecordFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let level = event.metadata().level();
        SystemTime.format_time(&mut writer)?;
        write!(writer, " ")?;

        let mut message = String::new();
        ctx.format_fields(Writer::new(&mut message), event)?;

        let prefix = ctx
            .event_scope()
            .and_then(|scope| scope.from_root().next())
            .map(|span| span.name());

        if self.ansi {
            write!(writer, "{}{:>5}{}", color(level), level, RESET)?;
        } else {
            write!(writer, "{:>5}", level)?;
        }
        if let Some(prefix) = prefix {
            write!(writer, " [{}]", prefix)?;
        }
        if self.ansi {
            writeln!(writer, " {}{}{}", color(level), reset_before_newlines(&message), RESET)
        } else {
            writeln!(writer, " {}", message)
        }
    }
}

/// Install the global subscriber. Records go to `log_file` when given, else
/// to standard error.
pub fn init(verbosity: Verbosity, log_file: Option<&Path>) -> std::io::Result<()> {
    let (writer, ansi) = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), std::io::stderr().is_terminal()),
    };

    // A second initialization (tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from_level(verbosity.0))
        .with_writer(writer)
        .event_format(RecordFormat { ansi })
        .try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_before_newlines() {
        assert_eq!(reset_before_newlines("single"), "single");
        assert_eq!(reset_before_newlines("a\nb"), "a\x1b[0m\nb");
        assert_eq!(reset_before_newlines("a\n\nb\n"), "a\x1b[0m\n\x1b[0m\nb\x1b[0m\n");
    }

    #[test]
    fn test_verbosity_names_and_numbers() {
        assert_eq!("debug".parse::<Verbosity>().unwrap().0, Level::DEBUG);
        assert_eq!("0".parse::<Verbosity>().unwrap().0, Level::DEBUG);
        assert_eq!("WARNING".parse::<Verbosity>().unwrap().0, Level::WARN);
        assert_eq!("3".parse::<Verbosity>().unwrap().0, Level::ERROR);
        assert!("4".parse::<Verbosity>().is_err());
        assert!("loud".parse::<Verbosity>().is_err());
        assert_eq!(Verbosity(Level::WARN).to_string(), "warning");
    }
}

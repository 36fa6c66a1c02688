//! Console logging: an `EnvFilter` driven subscriber whose lines are colored
//! by level.

use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// A tracing event formatter that colors the whole line by severity.
///
/// Only the event fields are written, with no timestamp, target or level
/// prefix, so progress lines read cleanly next to the result tables.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Fields are buffered so the color applies to the entire line.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        writeln!(writer, "{}", colorize(*event.metadata().level(), buffer))
    }
}

fn colorize(level: Level, line: String) -> ColoredString {
    match level {
        Level::INFO => line.white(),
        Level::WARN => line.yellow(),
        Level::ERROR => line.red(),
        Level::DEBUG => line.blue(),
        Level::TRACE => line.purple(),
    }
}

/// Filter directive used when `RUST_LOG` is not set.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "cluster_bench=debug,info"
    } else {
        "info"
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `verbose`.
/// Logs go to stderr so stdout carries only the result tables.
pub fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    // A second initialization (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .event_format(ColorizedFormatter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false), "info");
        assert!(default_directive(true).contains("debug"));
    }

    #[test]
    fn test_colorize_keeps_text() {
        colored::control::set_override(false);
        assert_eq!(colorize(Level::WARN, "careful".into()).to_string(), "careful");
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging(false);
        init_logging(true);
        tracing::info!("logging initialized");
    }
}

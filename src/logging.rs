use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// A custom tracing event formatter for colorizing log output based on level.
///
/// Audit-target events (policy denials) render dimmed-cyan so the denial
/// trail is visually separate from operational logs; everything else is
/// colored by severity.
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
        // Buffer the formatted fields to apply color to the entire line.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = if event.metadata().target() == "audit" {
            format!("[audit] {buffer}").cyan().dimmed()
        } else {
            match *event.metadata().level() {
                Level::INFO => buffer.white(),
                Level::WARN => buffer.yellow(),
                Level::ERROR => buffer.red(),
                Level::DEBUG => buffer.blue(),
                Level::TRACE => buffer.purple(),
            }
        };

        writeln!(writer, "{}", colored_output)
    }
}

/// Install the global subscriber: env-filtered, colorized.
///
/// `RUST_LOG` overrides the default `info` level as usual.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(ColorizedFormatter)
        .init();
}

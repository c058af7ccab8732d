//! Leveled console logger
//!
//! A `tracing-subscriber` event formatter that prints one line per event:
//! a localized timestamp, a colored severity tag and the message. At the
//! `debug` verbosity, error/warn/info events that carry structured fields
//! also echo those raw fields on a second line.
//!
//! ```ignore
//! use docrelay_common::logging::{self, LogLevel};
//!
//! logging::init(LogLevel::parse("debug"))?;
//! tracing::info!("Mongo connection successful...");
//! tracing::error!(error = %err, attempt = 3, "Connection attempt failed");
//! ```

use chrono::{DateTime, Utc};
use colored::{ColoredString, Colorize};
use std::fmt::{self, Write as _};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Environment variable holding the verbosity
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Timestamps are rendered in Etc/GMT+5 (UTC-05:00, no DST)
const TIMESTAMP_OFFSET_HOURS: i64 = 5;

/// Logger verbosity, from highest severity only to everything
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// Parse a level name. Unrecognized names fall back to `Info`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    /// Read the level from `LOG_LEVEL`, defaulting to `Info`
    pub fn from_env() -> Self {
        std::env::var(LOG_LEVEL_ENV)
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }

    /// Filter handed to the subscriber. `Debug` admits everything, trace included.
    pub fn level_filter(&self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::TRACE,
        }
    }

    /// Whether an event at `level` is emitted under this verbosity
    pub fn admits(&self, level: &Level) -> bool {
        self.level_filter() >= *level
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format an instant the way the console shows it: `M/D/YYYY, HH:MM:SS`
pub fn timestamp(now: DateTime<Utc>) -> String {
    let local = now.naive_utc() - chrono::Duration::hours(TIMESTAMP_OFFSET_HOURS);
    local.format("%-m/%-d/%Y, %H:%M:%S").to_string()
}

/// Colored severity tag. Trace events share the debug tag.
pub fn severity_tag(level: &Level) -> ColoredString {
    match *level {
        Level::ERROR => "ERROR".on_red(),
        Level::WARN => "WARN".black().on_yellow(),
        Level::INFO => "INFO".on_blue(),
        _ => "DEBUG".green(),
    }
}

/// Build the primary console line for one event
pub fn format_line(now: DateTime<Utc>, level: &Level, message: &str) -> String {
    format!("{} {} {}", timestamp(now), severity_tag(level), message)
}

/// Collects the message and any structured fields of an event
#[derive(Debug, Default)]
struct ContentVisitor {
    message: String,
    fields: Vec<(&'static str, String)>,
}

impl ContentVisitor {
    /// Render the structured fields the way they are echoed at debug verbosity
    fn raw(&self) -> String {
        let mut out = String::from("{ ");
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{}: {}", name, value);
        }
        out.push_str(" }");
        out
    }
}

impl Visit for ContentVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name(), format!("{:?}", value)));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push((field.name(), format!("{:?}", value)));
        }
    }
}

/// Event formatter for the leveled console output
#[derive(Debug, Clone, Copy)]
pub struct ConsoleFormat {
    level: LogLevel,
}

impl ConsoleFormat {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }
}

impl<S, N> FormatEvent<S, N> for ConsoleFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = event.metadata().level();
        let mut visitor = ContentVisitor::default();
        event.record(&mut visitor);

        // With only fields and no message, the fields are the content
        let message = if visitor.message.is_empty() {
            visitor.raw()
        } else {
            visitor.message.clone()
        };
        writeln!(writer, "{}", format_line(Utc::now(), level, &message))?;

        let echoes_raw = self.level == LogLevel::Debug
            && *level <= Level::INFO
            && !visitor.message.is_empty()
            && !visitor.fields.is_empty();
        if echoes_raw {
            writeln!(writer, "{}", visitor.raw())?;
        }
        Ok(())
    }
}

/// Install the console logger as the global default subscriber.
///
/// Error and warn lines go to stderr, everything else to stdout.
pub fn init(level: LogLevel) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let writer = std::io::stderr
        .with_max_level(Level::WARN)
        .or_else(std::io::stdout);

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level.level_filter())
        .event_format(ConsoleFormat::new(level))
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn capture_with(level: LogLevel, f: impl FnOnce()) -> String {
        let capture = Capture::default();
        let sink = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level.level_filter())
            .event_format(ConsoleFormat::new(level))
            .with_writer(move || sink.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        capture.contents()
    }

    #[test]
    fn test_parse_known_levels() {
        assert_eq!(LogLevel::parse("error"), LogLevel::Error);
        assert_eq!(LogLevel::parse("WARN"), LogLevel::Warn);
        assert_eq!(LogLevel::parse(" info "), LogLevel::Info);
        assert_eq!(LogLevel::parse("debug"), LogLevel::Debug);
    }

    #[test]
    fn test_parse_unknown_falls_back_to_info() {
        assert_eq!(LogLevel::parse("verbose"), LogLevel::Info);
        assert_eq!(LogLevel::parse(""), LogLevel::Info);
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_admits() {
        assert!(LogLevel::Error.admits(&Level::ERROR));
        assert!(!LogLevel::Error.admits(&Level::WARN));
        assert!(LogLevel::Info.admits(&Level::WARN));
        assert!(!LogLevel::Info.admits(&Level::DEBUG));
        assert!(LogLevel::Debug.admits(&Level::TRACE));
    }

    #[test]
    fn test_timestamp_is_gmt_minus_five() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 4, 5, 6).unwrap();
        assert_eq!(timestamp(now), "3/8/2024, 23:05:06");
    }

    #[test]
    fn test_format_line_contains_parts() {
        let now = Utc.with_ymd_and_hms(2024, 12, 25, 17, 0, 0).unwrap();
        let line = format_line(now, &Level::INFO, "Mongo connection successful...");
        assert!(line.starts_with("12/25/2024, 12:00:00 "));
        assert!(line.contains("INFO"));
        assert!(line.ends_with("Mongo connection successful..."));
    }

    #[test]
    fn test_trace_uses_debug_tag() {
        assert!(severity_tag(&Level::TRACE).to_string().contains("DEBUG"));
    }

    #[test]
    fn test_info_level_filters_debug() {
        let out = capture_with(LogLevel::Info, || {
            tracing::debug!("hidden");
            tracing::info!("shown");
        });
        assert!(!out.contains("hidden"));
        assert!(out.contains("shown"));
        assert_eq!(out.lines().count(), 1);
    }

    #[test]
    fn test_error_level_only_admits_errors() {
        let out = capture_with(LogLevel::Error, || {
            tracing::warn!("careful");
            tracing::error!("broken");
        });
        assert!(!out.contains("careful"));
        assert!(out.contains("ERROR"));
        assert!(out.contains("broken"));
    }

    #[test]
    fn test_debug_level_echoes_raw_fields() {
        let out = capture_with(LogLevel::Debug, || {
            tracing::error!(code = 18, reason = "auth", "Authentication failed");
        });
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("Authentication failed"));
        assert_eq!(lines[1], "{ code: 18, reason: \"auth\" }");
    }

    #[test]
    fn test_raw_fields_not_echoed_above_debug() {
        let out = capture_with(LogLevel::Info, || {
            tracing::error!(code = 18, "Authentication failed");
        });
        assert_eq!(out.lines().count(), 1);
    }

    #[test]
    fn test_debug_events_never_echo() {
        let out = capture_with(LogLevel::Debug, || {
            tracing::debug!(attempt = 2, "retrying");
        });
        assert_eq!(out.lines().count(), 1);
        assert!(out.contains("retrying"));
    }
}

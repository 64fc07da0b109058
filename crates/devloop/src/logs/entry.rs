//! Log entries and severity inference

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp layout used by the file sink and the console
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Success messages from build and test tools that mention errors or
/// failures without reporting any
pub const INFO_OVERRIDE_PATTERNS: &[&str] = &[
    "found 0 errors",
    "0 error(s)",
    "0 errors",
    "build succeeded",
    "compilation succeeded",
    "compiled successfully",
    "0 failed",
    "all tests passed",
];

/// Severity of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Uppercase label used in sink lines
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    /// Classify a raw output line.
    ///
    /// Lines matching [`INFO_OVERRIDE_PATTERNS`] are info. Otherwise the
    /// first match wins: error/exception/fatal/panic, then warn/warning,
    /// then debug/trace. Anything else is info. Matching is a
    /// case-insensitive substring search.
    pub fn infer(message: &str) -> Self {
        let lower = message.to_lowercase();
        let has = |tokens: &[&str]| tokens.iter().any(|t| lower.contains(t));

        if has(INFO_OVERRIDE_PATTERNS) {
            LogLevel::Info
        } else if has(&["error", "exception", "fatal", "panic"]) {
            LogLevel::Error
        } else if has(&["warn", "warning"]) {
            LogLevel::Warn
        } else if has(&["debug", "trace"]) {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single line of service output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub service: String,
    pub message: String,
    pub timestamp: DateTime<Local>,
    pub is_stderr: bool,
    pub level: LogLevel,
}

impl LogEntry {
    /// Create an entry stamped now, with the level inferred from the message
    pub fn new(service: impl Into<String>, message: impl Into<String>, is_stderr: bool) -> Self {
        let message = message.into();
        Self {
            service: service.into(),
            level: LogLevel::infer(&message),
            message,
            timestamp: Local::now(),
            is_stderr,
        }
    }

    /// Override the inferred level
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Override the timestamp
    pub fn at(mut self, timestamp: DateTime<Local>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Render as a sink line: `[timestamp] [LEVEL] [OUT|ERR] message`
    pub fn format_line(&self) -> String {
        format!(
            "[{}] [{}] [{}] {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.level,
            if self.is_stderr { "ERR" } else { "OUT" },
            self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_infer_level() {
        assert_eq!(LogLevel::infer("Error: boom"), LogLevel::Error);
        assert_eq!(LogLevel::infer("WARNING: low disk"), LogLevel::Warn);
        assert_eq!(LogLevel::infer("debug: trace id 1"), LogLevel::Debug);
        assert_eq!(LogLevel::infer("listening on :8080"), LogLevel::Info);
    }

    #[test]
    fn test_infer_level_priority() {
        // error beats warn, warn beats debug
        assert_eq!(LogLevel::infer("warn: error rate high"), LogLevel::Error);
        assert_eq!(LogLevel::infer("TRACE warn"), LogLevel::Warn);
        assert_eq!(LogLevel::infer("thread panicked"), LogLevel::Error);
        assert_eq!(LogLevel::infer("Unhandled Exception"), LogLevel::Error);
    }

    #[test]
    fn test_success_summaries_are_info() {
        assert_eq!(
            LogLevel::infer("Found 0 errors. Watching for file changes."),
            LogLevel::Info
        );
        assert_eq!(LogLevel::infer("webpack compiled successfully"), LogLevel::Info);
        assert_eq!(LogLevel::infer("Tests: 0 failed, 12 passed"), LogLevel::Info);
        assert_eq!(LogLevel::infer("Found 2 errors."), LogLevel::Error);
    }

    #[test]
    fn test_format_line() {
        let ts = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let entry = LogEntry::new("api", "ready", false).at(ts);
        assert_eq!(
            entry.format_line(),
            "[2024-03-09 14:05:07.000] [INFO] [OUT] ready"
        );

        let entry = LogEntry::new("api", "boom", true)
            .with_level(LogLevel::Error)
            .at(ts);
        assert_eq!(
            entry.format_line(),
            "[2024-03-09 14:05:07.000] [ERROR] [ERR] boom"
        );
    }
}

//! Logging infrastructure for the trading core
//!
//! Thin layer over the `log` facade with an `env_logger` backend:
//! - Categorizes log events by subsystem ([`LogContext`])
//! - Truncates transaction ids and addresses before they reach the log
//! - Provides both human-readable and JSON line output
//!
//! Credentials are never passed to any function in this module.
//!
//! # Usage
//!
//! ```
//! use bs_trading_core::logging::{self, LogConfig, LogContext, LogLevel};
//! use serde_json::json;
//!
//! logging::init(&LogConfig::default()).expect("Failed to initialize logging");
//!
//! logging::log_event(
//!     LogLevel::Info,
//!     LogContext::Reservation,
//!     "reservation_acquired",
//!     Some(json!({ "inputs": 2 })),
//! );
//! ```

use chrono::Local;
use log::{debug, LevelFilter};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write as IoWrite;
use std::sync::Once;

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Subsystem a log event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogContext {
    /// UTXO inventory and reservation table
    Reservation,
    /// Coin selection
    Selection,
    /// Settlement container state machines
    Settlement,
    /// Signing requests and results
    Signing,
    /// Fee estimation, broadcast and blockchain monitoring
    Network,
}

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_level")]
    pub level: LogLevel,
    /// Path to log file (None for console-only)
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default = "default_true")]
    pub include_timestamps: bool,
    #[serde(default)]
    pub include_source_location: bool,
    /// Whether to use JSON lines (machine-readable)
    #[serde(default)]
    pub json_format: bool,
}

fn default_level() -> LogLevel {
    LogLevel::Info
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            log_file: None,
            include_timestamps: true,
            include_source_location: false,
            json_format: false,
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

static LOGGING_INIT: Once = Once::new();

/// Initialize the logging system with the given configuration
///
/// Safe to call multiple times; only the first call configures the backend.
/// A logger installed by someone else is left in place.
pub fn init(config: &LogConfig) -> Result<(), String> {
    let mut result = Ok(());

    let include_timestamps = config.include_timestamps;
    let include_source_location = config.include_source_location;
    let json_format = config.json_format;
    let log_file = config.log_file.clone();
    let level = config.level;

    LOGGING_INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(level.into());

        builder.format(move |buf, record| {
            let timestamp = if include_timestamps {
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
            } else {
                String::new()
            };

            let source_location = if include_source_location {
                format!(" [{}:{}]", record.file().unwrap_or("unknown"), record.line().unwrap_or(0))
            } else {
                String::new()
            };

            if json_format {
                let line = json!({
                    "timestamp": timestamp,
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "location": source_location.trim(),
                    "message": record.args().to_string(),
                });
                writeln!(buf, "{}", line)
            } else {
                let mut style = buf.style();
                style.set_bold(true);
                if include_timestamps {
                    write!(buf, "{} ", timestamp)?;
                }
                writeln!(
                    buf,
                    "[{}{}] {}",
                    style.value(record.level()),
                    source_location,
                    record.args()
                )
            }
        });

        if let Some(file_path) = &log_file {
            match OpenOptions::new().create(true).append(true).open(file_path) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                }
                Err(e) => {
                    result = Err(format!("Failed to open log file {}: {}", file_path, e));
                    return;
                }
            }
        }

        if let Err(e) = builder.try_init() {
            // Tests and embedding applications may have installed a logger already
            debug!("Logger already initialized: {}", e);
        }
    });

    result
}

/// Truncate a potentially sensitive string for logging
///
/// Keeps the first and last four characters of txids and addresses so log
/// lines can still be correlated.
pub fn sanitize_for_logging(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }

    let len = input.chars().count();
    if len <= 8 {
        return "*****".to_string();
    }

    let first: String = input.chars().take(4).collect();
    let last: String = input.chars().skip(len - 4).collect();
    format!("{}...{}", first, last)
}

/// Write a structured event for the given subsystem
pub fn log_event(level: LogLevel, context: LogContext, event: &str, params: Option<serde_json::Value>) {
    match params {
        Some(params) => log::log!(level.into(), "[{:?}] {} {}", context, event, params),
        None => log::log!(level.into(), "[{:?}] {}", context, event),
    }
}

/// Log a reservation table event
pub fn log_reservation(level: LogLevel, event: &str, params: Option<serde_json::Value>) {
    log_event(level, LogContext::Reservation, event, params);
}

/// Log a coin selection event
pub fn log_selection(level: LogLevel, event: &str, params: Option<serde_json::Value>) {
    log_event(level, LogContext::Selection, event, params);
}

/// Log a settlement state machine event
pub fn log_settlement(level: LogLevel, event: &str, params: Option<serde_json::Value>) {
    log_event(level, LogContext::Settlement, event, params);
}

/// Log a signing event
pub fn log_signing(level: LogLevel, event: &str, params: Option<serde_json::Value>) {
    log_event(level, LogContext::Signing, event, params);
}

/// Log a fee, broadcast or monitor event
pub fn log_network(level: LogLevel, event: &str, params: Option<serde_json::Value>) {
    log_event(level, LogContext::Network, event, params);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_short_and_long() {
        assert_eq!(sanitize_for_logging(""), "");
        assert_eq!(sanitize_for_logging("abc"), "*****");
        assert_eq!(
            sanitize_for_logging("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"),
            "bc1q...f3t4"
        );
    }

    #[test]
    fn test_log_config_defaults_from_toml() {
        let config: LogConfig = toml::from_str("level = \"debug\"").unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert!(config.include_timestamps);
        assert!(!config.json_format);
    }
}

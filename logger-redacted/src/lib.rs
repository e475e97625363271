//! Tracing setup and PII redaction for CareCircle clients
//!
//! Care-coordination payloads and server error bodies routinely contain names,
//! phone numbers and email addresses of care recipients. Anything free-form
//! that ends up in a log line or in persisted sync state goes through
//! [`redact`] first.
//!
//! # Example
//!
//! ```rust,no_run
//! use logger_redacted::{init_tracing, redact, LoggerConfig};
//!
//! init_tracing(&LoggerConfig::default()).unwrap();
//! tracing::warn!(detail = %redact("caller (555) 123-4567 rejected"), "replay failed");
//! ```

pub mod config;
pub mod redactor;

pub use config::*;
pub use redactor::*;

use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("Tracing initialization failed: {0}")]
    InitFailed(String),
}

pub type Result<T> = std::result::Result<T, LoggerError>;

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over `config.log_level` when set. Events go to stderr so
/// stdout stays free for command output. Fails if a global subscriber is
/// already installed.
pub fn init_tracing(config: &LoggerConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!(
            "{level},sqlx=warn,hyper=info,reqwest=info,tungstenite=info",
            level = config.log_level
        ))
        .map_err(|e| LoggerError::InvalidFilter(e.to_string()))?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match config.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(config.with_source_location)
                    .with_line_number(config.with_source_location)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init(),
    };

    installed.map_err(|e| LoggerError::InitFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_raises_level() {
        let config = LoggerConfig::default().verbose(true);
        assert_eq!(config.log_level, "debug");
        let config = LoggerConfig::default().verbose(false);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_second_init_fails() {
        let config = LoggerConfig {
            format: LogFormat::Json,
            ..Default::default()
        };
        // Another test binary thread may have won the race; either way the second call must fail.
        let _ = init_tracing(&config);
        assert!(matches!(init_tracing(&config), Err(LoggerError::InitFailed(_))));
    }
}

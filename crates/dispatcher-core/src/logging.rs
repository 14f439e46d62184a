//! Tracing subscriber setup for dispatcher binaries

use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{DispatcherError, Result};

/// How events are written to stderr
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = DispatcherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(DispatcherError::Config(format!("Invalid log format: {}", other))),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` directives are honoured on top
/// of `level`. Fails if a subscriber is already installed.
pub fn setup_logging(level: Level, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| DispatcherError::Config(format!("logging already initialized: {}", e)))
}

pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| DispatcherError::Config(format!("Invalid log level: {}", level)))
}

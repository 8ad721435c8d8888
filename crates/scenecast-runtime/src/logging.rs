//! Tracing subscriber setup for hosting applications
//!
//! Library code only emits `tracing` records. Binaries and tests that want
//! to see them call [`init_tracing`] once.

use scenecast_core::{SceneCastError, SceneCastResult};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub default_directive: String,
    pub format: LogFormat,
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            default_directive: "scenecast=info".into(),
            format: LogFormat::Pretty,
            thread_names: true,
        }
    }
}

impl LoggingConfig {
    pub fn verbose() -> Self {
        LoggingConfig {
            default_directive: "scenecast=trace".into(),
            ..Default::default()
        }
    }
}

/// Install the global subscriber
///
/// Returns `Ok(false)` when a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> SceneCastResult<bool> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_directive))
        .map_err(|e| SceneCastError::InvalidConfig(format!("log filter: {}", e)))?;

    let result = match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_names(config.thread_names),
            )
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_thread_names(config.thread_names),
            )
            .with(filter)
            .try_init(),
    };
    Ok(result.is_ok())
}

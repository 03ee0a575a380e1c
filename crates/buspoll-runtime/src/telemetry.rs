//! Tracing subscriber initialisation for buspoll hosts.
//!
//! Call [`init_tracing`] once at process startup.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `BUSPOLL_LOG_FORMAT=json` | Emit newline-delimited JSON logs, overriding the requested format. |
//!
//! # Example
//!
//! ```rust,no_run
//! use buspoll_runtime::telemetry::{init_tracing, LogFormat};
//!
//! init_tracing(LogFormat::Compact);
//! ```

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable that forces the log format.
pub const LOG_FORMAT_ENV: &str = "BUSPOLL_LOG_FORMAT";

/// Console log layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected compact or json)")),
        }
    }
}

impl LogFormat {
    /// `BUSPOLL_LOG_FORMAT` if set and valid, otherwise `self`.
    pub fn with_env_override(self) -> Self {
        std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self)
    }
}

/// Install the global `tracing` subscriber.
///
/// Returns `false` if a global subscriber was already installed (e.g. by a
/// test harness); the existing one is kept.
pub fn init_tracing(format: LogFormat) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match format.with_env_override() {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_thread_names(true),
            )
            .try_init(),
    };
    result.is_ok()
}

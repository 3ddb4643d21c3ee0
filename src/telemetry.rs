//! Tracing subscriber setup.
//!
//! Logs go to stderr so command output on stdout stays machine-readable.
//! `COLONY_LOG` takes an `EnvFilter` directive (default `info`);
//! `COLONY_LOG_FORMAT=json` switches to one JSON object per line, which is
//! what the daemon should use under a supervisor.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub const ENV_LOG: &str = "COLONY_LOG";
pub const ENV_LOG_FORMAT: &str = "COLONY_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var(ENV_LOG_FORMAT).as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Held by `main` for the life of the process.
pub struct TelemetryGuard {
    _private: (),
}

pub fn init() -> TelemetryGuard {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .with_env_var(ENV_LOG)
        .from_env_lossy();

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match LogFormat::from_env() {
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        ),
        LogFormat::Text => Box::new(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        ),
    };

    // try_init: tests and embedders may already have installed a subscriber.
    let _ = Registry::default().with(fmt_layer).with(filter).try_init();

    TelemetryGuard { _private: () }
}

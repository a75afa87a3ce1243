//! Process-wide log subscriber.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "kobold=info,warn";

/// Set to `json` for one JSON object per line.
pub const LOG_FORMAT_VAR: &str = "KOBOLD_LOG_FORMAT";

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("a global subscriber is already installed: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("a `log` logger is already installed: {0}")]
    Logger(#[from] log::SetLoggerError),
}

/// Installs the tracing subscriber (filtered by `RUST_LOG`) and routes
/// `log` records into it.
pub fn init() -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let json = std::env::var(LOG_FORMAT_VAR).is_ok_and(|v| v.trim().eq_ignore_ascii_case("json"));
    let output = if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let subscriber = tracing_subscriber::registry().with(output).with(filter);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

use crate::error::{Result, TelemetryError};
use config_engine::{LogFormat, LoggingConfig};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// `RUST_LOG` wins over the configured level.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| TelemetryError::Tracing(format!("invalid level '{}': {}", config.level, e))),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn try_init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339()),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_line_number(true)
                    .with_timer(ChronoUtc::rfc_3339()),
            )
            .try_init(),
    };
    installed.map_err(|e| TelemetryError::Tracing(e.to_string()))?;

    tracing::info!(level = %config.level, format = ?config.format, "Tracing initialized");
    Ok(())
}

/// Like [`try_init_tracing`], but an existing subscriber is left in place.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    // Only a bad filter is worth reporting.
    build_filter(config)?;
    if try_init_tracing(config).is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}

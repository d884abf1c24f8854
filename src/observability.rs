//! Tracing subscriber initialization

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::Result;

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` overrides the configured level. The `json` format emits one
/// structured object per event; anything else is human-readable text.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    if config.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        level = %config.level,
        format = %config.format,
        "tracing initialized"
    );
    Ok(())
}

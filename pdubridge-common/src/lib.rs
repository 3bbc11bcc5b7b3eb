//! PDU Bridge Common Library
//!
//! Shared types and utilities for the PDU bridge:
//!
//! - [`model`] - Decoded PDU state ([`Snapshot`] and friends) and value scaling
//! - [`config`] - Device and bridge configuration, JSON5 loading
//! - [`topics`] - MQTT topic builders and filter matching
//! - [`error`] - Error types carrying the bridge's error taxonomy

pub mod config;
pub mod error;
pub mod model;
pub mod topics;

// Re-export commonly used types at the crate root
pub use config::{
    BridgeSettings, DeviceConfig, LogFormat, LoggingConfig, SerialConfig, TransportSelector,
    load_config, parse_config, validate_device_id,
};
pub use error::{Error, Result};
pub use model::{
    AtsBlock, AtsSource, BankMetrics, ColdstartState, ContactReading, ContactState,
    EnvironmentBlock, Identity, InputMetrics, LoadState, OutletMetrics, OutletState, Snapshot,
    SourceMetrics, SourceStatus, RedundancyStatus, Totals, current_timestamp_millis,
    scale_current, scale_hundredths, scale_power, scale_tenths,
};
pub use topics::{
    BRIDGE_STATUS_TOPIC, TOPIC_ROOT, TopicBuilder, outlet_command_filter, parse_outlet_command,
    topic_matches,
};

/// Initialize tracing with the given configuration.
///
/// Supports text (default) and JSON output. `RUST_LOG` takes precedence over
/// the configured level when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}

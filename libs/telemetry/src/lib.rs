//! Logging and metrics helpers shared by the gateway bridge services.
//!
//! Logs go through `tracing` with an env-filtered fmt subscriber; counters go
//! through the `metrics` facade so the embedding binary can pick a recorder.

use anyhow::Result;

mod config;
mod counters;
mod spans;
mod tracing_init;

pub use config::TelemetryConfig;
pub use counters::{
    DELIVERY_ATTEMPTS, MESSAGES_PERSISTED, WEBHOOK_UPDATES, record_delivery_attempt,
    record_persisted, record_update_outcome,
};
pub use spans::{start_message_span, start_update_span};
pub use tracing_init::init_telemetry;

/// Installs the process subscriber configured from `RUST_LOG` and `LOG_FORMAT`.
pub fn install(service_name: &str) -> Result<()> {
    init_telemetry(TelemetryConfig::from_env(service_name))
}

//! Drains outbound messages waiting for delivery and sends them through the Graph API.

pub mod config;
pub mod worker;

pub use config::EgressConfig;
pub use worker::{DrainReport, EgressWorker};

//! Gateway bridge core records and contracts.
//!
//! This crate holds the records persisted by the bridge, the [`RecordStore`] contract
//! with its in-memory and SQLite implementations, sender identity resolution, the
//! button action registry, and the WhatsApp Cloud API plumbing shared by the ingress
//! and egress services.
pub mod actions;
pub mod config;
pub mod context;
pub mod identity;
pub mod platforms;
pub mod store;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
pub mod text;
pub mod types;

pub use actions::{ActionError, ActionRegistry, ButtonAction, ButtonParams};
pub use config::{BridgeConfig, ConfigError, DispatchConfig, IdentityConfig, MediaFailurePolicy};
pub use context::{RequestContext, SendContext};
pub use identity::IdentityResolver;
pub use store::{ChangeSet, InMemoryStore, Record, RecordStore, SharedRecordStore, StoreError};
pub use types::*;

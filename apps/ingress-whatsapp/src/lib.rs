//! WhatsApp ingress: subscription handshake, signature check and the inbound
//! update pipeline that turns webhook deliveries into stored conversation messages.

pub mod config;
pub mod dispatch;
pub mod hooks;
pub mod http;
pub mod mirror;
pub mod normalize;

pub use config::IngressConfig;
pub use dispatch::{DispatchOutcome, DispatchSettings, Dispatcher, UpdateRequest};
pub use http::router;
pub use mirror::{link_message, mirror_reply};
pub use normalize::{Normalized, NormalizeError, Normalizer};

use time::OffsetDateTime;

use crate::types::Gateway;

/// Per-delivery context passed explicitly through the inbound pipeline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub gateway: Gateway,
    pub received_at: OffsetDateTime,
}

impl RequestContext {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            received_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Identity of whoever authored an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendContext {
    pub sender_name: String,
}

impl SendContext {
    pub fn new(sender_name: impl Into<String>) -> Self {
        Self {
            sender_name: sender_name.into(),
        }
    }
}

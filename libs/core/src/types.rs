use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::text::sanitize_phone;

/// Generates a fresh record identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Lifecycle of a configured gateway.
///
/// ```
/// use gwb_core::GatewayState;
///
/// assert_eq!(GatewayState::Integrated.as_str(), "integrated");
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GatewayState {
    Pending,
    Integrated,
}

impl GatewayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayState::Pending => "pending",
            GatewayState::Integrated => "integrated",
        }
    }
}

/// Graph API credentials attached to a gateway.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub bearer_token: String,
    pub api_version: String,
    pub from_phone: String,
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("bearer_token", &"***")
            .field("api_version", &self.api_version)
            .field("from_phone", &self.from_phone)
            .finish()
    }
}

/// A configured connection to the messaging provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Gateway {
    pub id: String,
    pub name: String,
    pub token: String,
    pub gateway_type: String,
    pub state: GatewayState,
    pub webhook_secret: String,
    pub verify_token: String,
    pub credentials: ProviderCredentials,
}

impl Gateway {
    pub fn is_integrated(&self) -> bool {
        self.state == GatewayState::Integrated
    }
}

/// One conversation with one external party on one gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: String,
    pub gateway_id: String,
    /// External party identifier (the sender's phone number).
    pub gateway_channel_token: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A business record a message can be threaded onto instead of a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RecordRef {
    pub model: String,
    pub res_id: String,
}

/// Where a message lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThreadRef {
    Channel { channel_id: String },
    Record(RecordRef),
}

impl ThreadRef {
    pub fn channel(channel_id: impl Into<String>) -> Self {
        ThreadRef::Channel {
            channel_id: channel_id.into(),
        }
    }

    pub fn channel_id(&self) -> Option<&str> {
        match self {
            ThreadRef::Channel { channel_id } => Some(channel_id),
            ThreadRef::Record(_) => None,
        }
    }

    /// Flat key used for indexing threads in storage.
    pub fn key(&self) -> String {
        match self {
            ThreadRef::Channel { channel_id } => format!("channel:{channel_id}"),
            ThreadRef::Record(record) => format!("record:{}:{}", record.model, record.res_id),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub mimetype: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .field("mimetype", &self.mimetype)
            .field("len", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AuthorRef {
    Contact(String),
    Guest(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Ready,
    Sent,
    Exception,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Ready => "ready",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Exception => "exception",
        }
    }
}

/// Delivery bookkeeping carried by outbound messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    pub status: NotificationStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl Delivery {
    pub fn ready() -> Self {
        Self {
            status: NotificationStatus::Ready,
            failure_reason: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub thread: ThreadRef,
    pub direction: Direction,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Provider-assigned message id, unique across the store.
    #[serde(default)]
    pub provider_message_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub author: Option<AuthorRef>,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    #[serde(default)]
    pub from_webhook: bool,
    /// Copy of this message on a foreign record, if one was linked.
    #[serde(default)]
    pub mirror_id: Option<String>,
    #[serde(default)]
    pub delivery: Option<Delivery>,
}

impl Message {
    /// Fresh outbound message on a channel, queued for delivery.
    pub fn outbound(channel_id: &str, body: impl Into<String>, date: OffsetDateTime) -> Self {
        Self {
            id: new_id(),
            thread: ThreadRef::channel(channel_id),
            direction: Direction::Outbound,
            body: body.into(),
            attachments: Vec::new(),
            provider_message_id: None,
            parent_id: None,
            author: None,
            date,
            from_webhook: false,
            mirror_id: None,
            delivery: Some(Delivery::ready()),
        }
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.thread.channel_id()
    }

    pub fn delivery_status(&self) -> Option<NotificationStatus> {
        self.delivery.as_ref().map(|d| d.status)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PhoneField {
    Phone,
    Mobile,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub mobile: Option<String>,
    /// Which of the two numbers the provider reaches.
    #[serde(default)]
    pub whatsapp_field: Option<PhoneField>,
    #[serde(default)]
    pub priority: u8,
}

impl Contact {
    /// True when either stored number normalizes to `sanitized`.
    pub fn matches_phone(&self, sanitized: &str) -> bool {
        [self.phone.as_deref(), self.mobile.as_deref()]
            .into_iter()
            .flatten()
            .any(|number| sanitize_phone(number).as_deref() == Some(sanitized))
    }
}

/// Anonymous party identity scoped to one gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Guest {
    pub id: String,
    pub name: String,
    pub gateway_id: String,
    pub gateway_token: String,
}

/// Durable association (gateway, sender token) to a contact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityLink {
    pub id: String,
    pub name: String,
    pub gateway_id: String,
    pub gateway_token: String,
    pub contact_id: String,
}

/// Resolved sender of an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Actor {
    Contact(Contact),
    Guest(Guest),
}

impl Actor {
    pub fn author_ref(&self) -> AuthorRef {
        match self {
            Actor::Contact(contact) => AuthorRef::Contact(contact.id.clone()),
            Actor::Guest(guest) => AuthorRef::Guest(guest.id.clone()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Actor::Contact(contact) => &contact.name,
            Actor::Guest(guest) => &guest.name,
        }
    }

    pub fn contact_id(&self) -> Option<&str> {
        match self {
            Actor::Contact(contact) => Some(&contact.id),
            Actor::Guest(_) => None,
        }
    }

    pub fn priority(&self) -> Option<u8> {
        match self {
            Actor::Contact(contact) => Some(contact.priority),
            Actor::Guest(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    Draft,
    InProgress,
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lead {
    pub id: String,
    pub name: String,
    pub mobile: String,
    pub status: LeadStatus,
    /// Set once the interactive button offer has been answered.
    #[serde(default)]
    pub button_consumed: bool,
}

impl Lead {
    pub fn is_open_draft(&self) -> bool {
        self.status == LeadStatus::Draft && !self.button_consumed
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Waiting,
    Active,
    Closed,
}

/// Conversation waiting for (or held by) an operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub author: Option<AuthorRef>,
    pub priority: u8,
    pub state: QueueState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl QueueEntry {
    pub fn is_active(&self) -> bool {
        self.state != QueueState::Closed
    }
}

/// Pre-approved provider message template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub template_name: String,
    pub lang_code: String,
}

/// Record of one template send, keyed by the provider id it produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateSend {
    pub id: String,
    pub template_id: String,
    pub message_id: String,
    #[serde(default)]
    pub provider_message_id: Option<String>,
    pub body: String,
}

/// Maps a button payload of a template to a registered action name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ButtonBinding {
    pub id: String,
    pub template_id: String,
    pub payload: String,
    pub action: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Sent,
    Exception,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Sent => "sent",
            AttemptStatus::Exception => "exception",
        }
    }
}

/// Audit row for one HTTP call made towards the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryAttempt {
    pub id: String,
    pub message_id: String,
    pub url: String,
    pub headers: Value,
    pub json: Value,
    #[serde(default)]
    pub response: Option<String>,
    pub status: AttemptStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attachment_data_serializes_as_base64() {
        let attachment = Attachment {
            filename: "a.txt".into(),
            mimetype: "text/plain".into(),
            data: b"hi".to_vec(),
        };
        let value = serde_json::to_value(&attachment).unwrap();
        assert_eq!(value["data"], json!("aGk="));
        let back: Attachment = serde_json::from_value(value).unwrap();
        assert_eq!(back.data, b"hi");
    }

    #[test]
    fn thread_keys_distinguish_channels_and_records() {
        let channel = ThreadRef::channel("c1");
        let record = ThreadRef::Record(RecordRef {
            model: "crm.lead".into(),
            res_id: "7".into(),
        });
        assert_eq!(channel.key(), "channel:c1");
        assert_eq!(record.key(), "record:crm.lead:7");
        assert_eq!(channel.channel_id(), Some("c1"));
        assert_eq!(record.channel_id(), None);
    }

    #[test]
    fn contact_matches_either_number() {
        let contact = Contact {
            id: "p1".into(),
            name: "Ana".into(),
            phone: None,
            mobile: Some("+34 600 11 22 33".into()),
            whatsapp_field: Some(PhoneField::Mobile),
            priority: 0,
        };
        assert!(contact.matches_phone("+34600112233"));
        assert!(!contact.matches_phone("+34600112234"));
    }

    #[test]
    fn credentials_debug_hides_token() {
        let creds = ProviderCredentials {
            bearer_token: "secret-token".into(),
            api_version: "20.0".into(),
            from_phone: "1234".into(),
        };
        assert!(!format!("{creds:?}").contains("secret-token"));
    }
}

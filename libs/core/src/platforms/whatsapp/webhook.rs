//! Typed view of the provider's webhook delivery.
//!
//! Unknown fields are ignored; only the parts the gateway acts on are modelled.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShapeError {
    #[error("payload has no entry")]
    MissingEntry,
    #[error("entry has no changes")]
    MissingChanges,
    #[error("change carries neither messages nor statuses")]
    EmptyChange,
    #[error("message without id")]
    MissingMessageId,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<Entry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Change {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: ChangeValue,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub messaging_product: Option<String>,
    #[serde(default)]
    pub contacts: Vec<ContactInfo>,
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub statuses: Vec<serde_json::Value>,
}

impl ChangeValue {
    /// Profile name the provider reported for `wa_id`.
    pub fn profile_name(&self, wa_id: &str) -> Option<&str> {
        self.contacts
            .iter()
            .find(|contact| contact.wa_id.as_deref() == Some(wa_id))
            .and_then(|contact| contact.profile.as_ref())
            .and_then(|profile| profile.name.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactInfo {
    #[serde(default)]
    pub wa_id: Option<String>,
    #[serde(default)]
    pub profile: Option<Profile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<TextBody>,
    #[serde(default)]
    pub button: Option<ButtonReply>,
    #[serde(default)]
    pub context: Option<MessageContext>,
    #[serde(default)]
    pub image: Option<MediaRef>,
    #[serde(default)]
    pub audio: Option<MediaRef>,
    #[serde(default)]
    pub video: Option<MediaRef>,
    #[serde(default)]
    pub document: Option<MediaRef>,
    #[serde(default)]
    pub sticker: Option<MediaRef>,
    #[serde(default)]
    pub location: Option<Location>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextBody {
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ButtonReply {
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageContext {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub name: Option<String>,
}

/// Media slots in the order they are inspected.
pub const MEDIA_KINDS: [&str; 5] = ["image", "audio", "video", "document", "sticker"];

impl InboundMessage {
    pub fn media(&self, kind: &str) -> Option<&MediaRef> {
        match kind {
            "image" => self.image.as_ref(),
            "audio" => self.audio.as_ref(),
            "video" => self.video.as_ref(),
            "document" => self.document.as_ref(),
            "sticker" => self.sticker.as_ref(),
            _ => None,
        }
    }

    /// Provider id of the message being replied to, if any.
    pub fn reply_to(&self) -> Option<&str> {
        self.context
            .as_ref()
            .and_then(|ctx| ctx.id.as_deref())
            .filter(|id| !id.is_empty())
    }

    pub fn is_button(&self) -> bool {
        self.kind == "button" && self.button.is_some()
    }

    /// Payload of a button reply; falls back to the visible text.
    pub fn button_payload(&self) -> Option<&str> {
        if !self.is_button() {
            return None;
        }
        let button = self.button.as_ref()?;
        button
            .payload
            .as_deref()
            .or(button.text.as_deref())
            .filter(|value| !value.is_empty())
    }

    /// Visible button text; falls back to the payload.
    pub fn button_text(&self) -> Option<&str> {
        if !self.is_button() {
            return None;
        }
        let button = self.button.as_ref()?;
        button
            .text
            .as_deref()
            .or(button.payload.as_deref())
            .filter(|value| !value.is_empty())
    }
}

impl WebhookPayload {
    /// First change value; the delivery is rejected when the shape is wrong.
    pub fn first_value(&self) -> Result<&ChangeValue, ShapeError> {
        let entry = self.entry.first().ok_or(ShapeError::MissingEntry)?;
        let change = entry.changes.first().ok_or(ShapeError::MissingChanges)?;
        let value = &change.value;
        if value.messages.is_empty() && value.statuses.is_empty() {
            return Err(ShapeError::EmptyChange);
        }
        Ok(value)
    }

    /// True when the delivery only reports message statuses.
    pub fn is_status_only(&self) -> bool {
        self.first_value()
            .map(|value| value.messages.is_empty())
            .unwrap_or(false)
    }

    /// Every message of the `messages` changes, with the change value that carries it.
    pub fn messages(&self) -> impl Iterator<Item = (&ChangeValue, &InboundMessage)> {
        self.entry
            .iter()
            .flat_map(|entry| entry.changes.iter())
            .filter(|change| change.field.as_deref() == Some("messages"))
            .flat_map(|change| {
                change
                    .value
                    .messages
                    .iter()
                    .map(move |message| (&change.value, message))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> WebhookPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn parses_text_message_with_profile() {
        let payload = parse(json!({
            "object": "whatsapp_business_account",
            "entry": [{"changes": [{"field": "messages", "value": {
                "contacts": [{"wa_id": "34600000001", "profile": {"name": "Ana"}}],
                "messages": [{"id": "wamid.1", "from": "34600000001", "type": "text",
                              "timestamp": "1700000000", "text": {"body": "Hola"}}]
            }}]}]
        }));
        let value = payload.first_value().unwrap();
        assert_eq!(value.profile_name("34600000001"), Some("Ana"));
        let (_, message) = payload.messages().next().unwrap();
        assert_eq!(message.kind, "text");
        assert_eq!(message.text.as_ref().unwrap().body, "Hola");
        assert!(!payload.is_status_only());
    }

    #[test]
    fn status_only_delivery_is_detected() {
        let payload = parse(json!({
            "entry": [{"changes": [{"value": {"statuses": [{"id": "wamid.1", "status": "read"}]}}]}]
        }));
        assert!(payload.is_status_only());
    }

    #[test]
    fn empty_entry_is_a_shape_error() {
        let payload = parse(json!({"entry": []}));
        assert_eq!(payload.first_value().unwrap_err(), ShapeError::MissingEntry);
        let payload = parse(json!({"entry": [{"changes": [{"value": {}}]}]}));
        assert_eq!(payload.first_value().unwrap_err(), ShapeError::EmptyChange);
    }

    #[test]
    fn button_reply_falls_back_between_payload_and_text() {
        let payload = parse(json!({
            "entry": [{"changes": [{"field": "messages", "value": {"messages": [
                {"id": "wamid.2", "from": "1", "type": "button",
                 "button": {"text": "CONFIRMAR"}, "context": {"id": "wamid.tmpl"}}
            ]}}]}]
        }));
        let (_, message) = payload.messages().next().unwrap();
        assert_eq!(message.button_payload(), Some("CONFIRMAR"));
        assert_eq!(message.button_text(), Some("CONFIRMAR"));
        assert_eq!(message.reply_to(), Some("wamid.tmpl"));
    }

    #[test]
    fn other_fields_are_not_messages() {
        let payload = parse(json!({
            "entry": [{"changes": [
                {"field": "message_template_status_update", "value": {"messages": [
                    {"id": "wamid.x", "from": "1", "type": "text", "text": {"body": "no"}}
                ]}},
                {"field": "messages", "value": {"messages": [
                    {"id": "wamid.y", "from": "1", "type": "text", "text": {"body": "yes"}}
                ]}}
            ]}]
        }));
        let ids: Vec<&str> = payload.messages().map(|(_, m)| m.id.as_str()).collect();
        assert_eq!(ids, ["wamid.y"]);
    }

    #[test]
    fn profile_name_requires_matching_wa_id() {
        let payload = parse(json!({
            "entry": [{"changes": [{"field": "messages", "value": {
                "contacts": [{"wa_id": "111", "profile": {"name": "Ana"}}],
                "messages": [{"id": "wamid.1", "from": "222", "type": "text"}]
            }}]}]
        }));
        let value = payload.first_value().unwrap();
        assert_eq!(value.profile_name("111"), Some("Ana"));
        assert_eq!(value.profile_name("222"), None);
    }
}

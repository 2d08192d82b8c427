//! Outbound delivery of stored messages through the Graph API.
//!
//! Every HTTP call towards the provider leaves a [`DeliveryAttempt`] behind, whatever
//! its outcome. In lenient mode failures are recorded on the message; in strict mode
//! they surface to the caller.

use std::sync::Arc;

use serde_json::{Value, json};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{Instrument, error, info, info_span, warn};

use super::mimetypes::MediaKind;
use super::transport::{GraphEndpoints, GraphResponse, GraphTransport, MediaUpload, TransportError};
use crate::context::SendContext;
use crate::store::{ChangeSet, RecordStore, StoreError};
use crate::text::{html_to_plain, sign_body, strip_signature};
use crate::types::{
    Attachment, AttemptStatus, Channel, Delivery, DeliveryAttempt, Gateway, Message,
    NotificationStatus, Template, TemplateSend, new_id,
};

const REDACTED_AUTH: &str = "Bearer ***";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    /// Record failures on the message and report them as an outcome.
    #[default]
    Lenient,
    /// Return failures as [`SendError::Delivery`].
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent { provider_message_ids: Vec<String> },
    Failed { reason: String },
    /// Nothing to transmit: empty body and no attachments.
    Skipped,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("mimetype `{mimetype}` of `{filename}` is not accepted by the provider")]
    UnsupportedMimetype { filename: String, mimetype: String },
    #[error("message {0} not found")]
    MissingMessage(String),
    #[error("message {0} does not belong to a channel")]
    NotInChannel(String),
    #[error("channel {0} not found")]
    MissingChannel(String),
    #[error("unable to send the whatsapp message: {reason}")]
    Delivery { reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
enum AttemptFailure {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("provider answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider response lacks {0}")]
    MissingId(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a template send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDelivery {
    pub message_id: String,
    pub channel_id: String,
    pub outcome: DeliveryOutcome,
}

pub struct OutboundSender {
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn GraphTransport>,
    api_base: String,
}

pub fn text_payload(to: &str, body: &str, reply_to: Option<&str>) -> Value {
    let mut payload = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "text",
        "text": {"preview_url": false, "body": body},
    });
    if let Some(reply_to) = reply_to {
        payload["context"] = json!({"message_id": reply_to});
    }
    payload
}

pub fn media_payload(to: &str, kind: MediaKind, media_id: &str, filename: &str) -> Value {
    let mut media = json!({"id": media_id});
    if kind == MediaKind::Document {
        media["filename"] = json!(filename);
    }
    let mut payload = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": kind.as_str(),
    });
    payload[kind.as_str()] = media;
    payload
}

pub fn template_payload(to: &str, template: &Template, parameters: &[String]) -> Value {
    let mut body = json!({
        "name": template.template_name,
        "language": {"code": template.lang_code},
    });
    if !parameters.is_empty() {
        let params: Vec<Value> = parameters
            .iter()
            .map(|value| json!({"type": "text", "text": value}))
            .collect();
        body["components"] = json!([{"type": "body", "parameters": params}]);
    }
    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "template",
        "template": body,
    })
}

/// Attachments paired with the provider message type they travel as.
pub fn classify_attachments(
    attachments: &[Attachment],
) -> Result<Vec<(&Attachment, MediaKind)>, SendError> {
    attachments
        .iter()
        .map(|attachment| {
            MediaKind::for_mimetype(&attachment.mimetype)
                .map(|kind| (attachment, kind))
                .ok_or_else(|| SendError::UnsupportedMimetype {
                    filename: attachment.filename.clone(),
                    mimetype: attachment.mimetype.clone(),
                })
        })
        .collect()
}

fn first_message_id(response: &GraphResponse) -> Option<String> {
    let raw = response.json().ok()?;
    raw.get("messages")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn media_id(response: &GraphResponse) -> Option<String> {
    let raw = response.json().ok()?;
    raw.get("id").and_then(Value::as_str).map(str::to_string)
}

impl OutboundSender {
    pub fn new(
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn GraphTransport>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transport,
            api_base: api_base.into(),
        }
    }

    /// Delivers a stored outbound message to its channel's external party.
    pub async fn send(
        &self,
        ctx: &SendContext,
        gateway: &Gateway,
        message_id: &str,
        mode: SendMode,
    ) -> Result<DeliveryOutcome, SendError> {
        let message = self
            .store
            .message(message_id)
            .await?
            .ok_or_else(|| SendError::MissingMessage(message_id.to_string()))?;
        let channel_id = message
            .channel_id()
            .ok_or_else(|| SendError::NotInChannel(message_id.to_string()))?;
        let channel = self
            .store
            .channel_by_id(channel_id)
            .await?
            .ok_or_else(|| SendError::MissingChannel(channel_id.to_string()))?;

        let span = info_span!("whatsapp.send", message = %message.id, channel = %channel.id);
        async move {
            let attachments = match classify_attachments(&message.attachments) {
                Ok(attachments) => attachments,
                Err(err) => {
                    warn!(error = %err, "refusing to send attachment");
                    self.mark_failed(&message.id, &err.to_string()).await?;
                    return Err(err);
                }
            };

            match self
                .deliver(ctx, gateway, &channel, &message, &attachments)
                .await
            {
                Ok(ids) if ids.is_empty() => {
                    self.update_delivery(&message.id, |message| message.delivery = None)
                        .await?;
                    Ok(DeliveryOutcome::Skipped)
                }
                Ok(ids) => {
                    self.mark_sent(&message.id, ids.first().cloned()).await?;
                    info!(count = ids.len(), "whatsapp message delivered");
                    Ok(DeliveryOutcome::Sent {
                        provider_message_ids: ids,
                    })
                }
                Err(failure) => {
                    let reason = failure.to_string();
                    error!(%reason, "unable to send the whatsapp message");
                    match mode {
                        SendMode::Strict => Err(SendError::Delivery { reason }),
                        SendMode::Lenient => {
                            self.mark_failed(&message.id, &reason).await?;
                            Ok(DeliveryOutcome::Failed { reason })
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Sends a named template (or plain text when the template is unknown) to `mobile`.
    pub async fn send_template(
        &self,
        gateway: &Gateway,
        template_name: &str,
        parameters: &[String],
        mobile: &str,
        mode: SendMode,
    ) -> Result<TemplateDelivery, SendError> {
        let now = OffsetDateTime::now_utc();
        let mut changes = ChangeSet::new();
        let channel = match self.store.channel(&gateway.id, mobile).await? {
            Some(channel) => channel,
            None => {
                let channel = Channel {
                    id: new_id(),
                    gateway_id: gateway.id.clone(),
                    gateway_channel_token: mobile.to_string(),
                    name: mobile.to_string(),
                    created_at: now,
                };
                changes.put(channel.clone());
                channel
            }
        };

        let template = self.store.template(template_name).await?;
        let body = parameters.join(" ");
        let mut message = Message::outbound(&channel.id, body.clone(), now);
        // posted right below, keep it out of the egress queue
        message.delivery = None;
        let payload = match &template {
            Some(template) => template_payload(mobile, template, parameters),
            None => {
                warn!(template = template_name, "unknown template, sending plain text");
                text_payload(mobile, &body, None)
            }
        };
        changes.put(message.clone());
        self.store.commit(changes).await?;

        let url = GraphEndpoints::new(&self.api_base, &gateway.credentials).messages();
        let result = self
            .call_json(&message.id, &url, gateway, &payload)
            .await
            .and_then(|response| {
                first_message_id(&response).ok_or(AttemptFailure::MissingId("messages[0].id"))
            });

        let outcome = match result {
            Ok(provider_id) => {
                let mut changes = ChangeSet::new();
                if let Some(template) = &template {
                    changes.put(TemplateSend {
                        id: new_id(),
                        template_id: template.id.clone(),
                        message_id: message.id.clone(),
                        provider_message_id: Some(provider_id.clone()),
                        body: body.clone(),
                    });
                }
                message.provider_message_id = Some(provider_id.clone());
                message.delivery = Some(Delivery {
                    status: NotificationStatus::Sent,
                    failure_reason: None,
                });
                changes.put(message.clone());
                self.store.commit(changes).await?;
                DeliveryOutcome::Sent {
                    provider_message_ids: vec![provider_id],
                }
            }
            Err(failure) => {
                let reason = failure.to_string();
                error!(%reason, template = template_name, "template send failed");
                if mode == SendMode::Strict {
                    return Err(SendError::Delivery { reason });
                }
                self.mark_failed(&message.id, &reason).await?;
                DeliveryOutcome::Failed { reason }
            }
        };

        Ok(TemplateDelivery {
            message_id: message.id,
            channel_id: channel.id,
            outcome,
        })
    }

    async fn deliver(
        &self,
        ctx: &SendContext,
        gateway: &Gateway,
        channel: &Channel,
        message: &Message,
        attachments: &[(&Attachment, MediaKind)],
    ) -> Result<Vec<String>, AttemptFailure> {
        let endpoints = GraphEndpoints::new(&self.api_base, &gateway.credentials);
        let to = channel.gateway_channel_token.as_str();
        let mut provider_ids = Vec::new();

        for (attachment, kind) in attachments {
            let upload_url = endpoints.media();
            let response = self
                .call_media(&message.id, &upload_url, gateway, attachment)
                .await?;
            let media_id = media_id(&response).ok_or(AttemptFailure::MissingId("media id"))?;
            let payload = media_payload(to, *kind, &media_id, &attachment.filename);
            let response = self
                .call_json(&message.id, &endpoints.messages(), gateway, &payload)
                .await?;
            provider_ids.extend(first_message_id(&response));
        }

        let plain = html_to_plain(&message.body);
        if !plain.is_empty() {
            let reply_to = self.reply_context(message).await?;
            let body = sign_body(&ctx.sender_name, &plain);
            let payload = text_payload(to, &body, reply_to.as_deref());
            let response = self
                .call_json(&message.id, &endpoints.messages(), gateway, &payload)
                .await?;
            let provider_id =
                first_message_id(&response).ok_or(AttemptFailure::MissingId("messages[0].id"))?;
            provider_ids.push(provider_id);
        }
        Ok(provider_ids)
    }

    /// Provider id to quote, from the explicit parent or the matching earlier message.
    async fn reply_context(&self, message: &Message) -> Result<Option<String>, StoreError> {
        let parent_id = match &message.parent_id {
            Some(parent_id) => Some(parent_id.clone()),
            None => {
                let formatted = strip_signature(&html_to_plain(&message.body));
                let history = self.store.thread_messages(&message.thread).await?;
                // newest match wins
                history
                    .into_iter()
                    .filter(|earlier| earlier.id != message.id)
                    .find(|earlier| strip_signature(&html_to_plain(&earlier.body)) == formatted)
                    .and_then(|earlier| earlier.parent_id)
            }
        };
        let Some(parent_id) = parent_id else {
            return Ok(None);
        };
        Ok(self
            .store
            .message(&parent_id)
            .await?
            .and_then(|parent| parent.provider_message_id))
    }

    async fn call_json(
        &self,
        message_id: &str,
        url: &str,
        gateway: &Gateway,
        payload: &Value,
    ) -> Result<GraphResponse, AttemptFailure> {
        let result = self
            .transport
            .post_json(url, &gateway.credentials.bearer_token, payload)
            .await;
        self.record_attempt(message_id, url, payload.clone(), result)
            .await
    }

    async fn call_media(
        &self,
        message_id: &str,
        url: &str,
        gateway: &Gateway,
        attachment: &Attachment,
    ) -> Result<GraphResponse, AttemptFailure> {
        let upload = MediaUpload {
            filename: attachment.filename.clone(),
            mimetype: attachment.mimetype.clone(),
            data: attachment.data.clone(),
        };
        let result = self
            .transport
            .post_media(url, &gateway.credentials.bearer_token, upload)
            .await;
        let described = json!({
            "messaging_product": "whatsapp",
            "file": attachment.filename,
            "type": attachment.mimetype,
        });
        self.record_attempt(message_id, url, described, result)
            .await
    }

    async fn record_attempt(
        &self,
        message_id: &str,
        url: &str,
        payload: Value,
        result: Result<GraphResponse, TransportError>,
    ) -> Result<GraphResponse, AttemptFailure> {
        let (response_text, outcome) = match result {
            Ok(response) if response.is_success() => (Some(response.text()), Ok(response)),
            Ok(response) => {
                let body = response.text();
                (
                    Some(body.clone()),
                    Err(AttemptFailure::Status {
                        status: response.status,
                        body,
                    }),
                )
            }
            Err(err) => (None, Err(AttemptFailure::Transport(err))),
        };
        let status = if outcome.is_ok() {
            AttemptStatus::Sent
        } else {
            AttemptStatus::Exception
        };
        let attempt = DeliveryAttempt {
            id: new_id(),
            message_id: message_id.to_string(),
            url: url.to_string(),
            headers: json!({"Authorization": REDACTED_AUTH}),
            json: payload,
            response: response_text,
            status,
            failure_reason: outcome.as_ref().err().map(ToString::to_string),
            created_at: OffsetDateTime::now_utc(),
        };
        gwb_telemetry::record_delivery_attempt(status.as_str());
        let mut changes = ChangeSet::new();
        changes.put(attempt);
        self.store.commit(changes).await?;
        outcome
    }

    async fn mark_sent(
        &self,
        message_id: &str,
        provider_id: Option<String>,
    ) -> Result<(), StoreError> {
        self.update_delivery(message_id, |message| {
            message.delivery = Some(Delivery {
                status: NotificationStatus::Sent,
                failure_reason: None,
            });
            if message.provider_message_id.is_none() {
                message.provider_message_id = provider_id;
            }
        })
        .await
    }

    async fn mark_failed(&self, message_id: &str, reason: &str) -> Result<(), StoreError> {
        self.update_delivery(message_id, |message| {
            message.delivery = Some(Delivery {
                status: NotificationStatus::Exception,
                failure_reason: Some(reason.to_string()),
            });
        })
        .await
    }

    async fn update_delivery(
        &self,
        message_id: &str,
        apply: impl FnOnce(&mut Message),
    ) -> Result<(), StoreError> {
        let mut message = self
            .store
            .message(message_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        apply(&mut message);
        let mut changes = ChangeSet::new();
        changes.put(message);
        self.store.commit(changes).await
    }
}

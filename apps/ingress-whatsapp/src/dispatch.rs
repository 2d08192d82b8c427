//! Inbound update pipeline: one webhook delivery in, one atomic commit out.
//!
//! Shape check, status-only short-circuit and the replay guard all run before any
//! side effect. Each message of the delivery is then resolved to a channel and an
//! author, normalized, threaded to its parent and handed to the hooks. Everything
//! staged for the delivery is committed at once; the unique provider id makes a
//! concurrent replay fail the commit instead of writing twice.

use std::sync::Arc;

use gwb_core::platforms::whatsapp::webhook::ChangeValue;
use gwb_core::platforms::whatsapp::{
    InboundMessage, OutboundSender, SendMode, WebhookPayload,
};
use gwb_core::store::{ChangeSet, SharedRecordStore, StoreError};
use gwb_core::{
    ActionRegistry, Channel, Direction, DispatchConfig, Gateway, GatewayState, IdentityConfig,
    IdentityResolver, MediaFailurePolicy, Message, RequestContext, SendContext, ThreadRef,
    new_id,
};
use gwb_telemetry::{
    record_persisted, record_update_outcome, start_message_span, start_update_span,
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{Instrument, debug, error, info, warn};

use crate::hooks::{HookInput, Hooks};
use crate::mirror::mirror_reply;
use crate::normalize::{NormalizeError, Normalizer};

/// One POST as received by the HTTP layer.
#[derive(Debug, Clone, Copy)]
pub struct UpdateRequest<'a> {
    pub usage: &'a str,
    pub token: &'a str,
    pub signature: Option<&'a str>,
    pub body: &'a [u8],
}

/// How a delivery ended. The provider sees `200 {}` for all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Processed { persisted: usize },
    Malformed,
    StatusOnly,
    Duplicate,
    UnknownGateway,
    Unauthenticated,
    Failed,
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Processed { .. } => "processed",
            DispatchOutcome::Malformed => "malformed",
            DispatchOutcome::StatusOnly => "status_only",
            DispatchOutcome::Duplicate => "duplicate",
            DispatchOutcome::UnknownGateway => "unknown_gateway",
            DispatchOutcome::Unauthenticated => "unauthenticated",
            DispatchOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Error)]
enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Media(#[from] NormalizeError),
}

/// Behaviour knobs of the dispatcher, usually taken from the bridge configuration.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub identity: IdentityConfig,
    pub dispatch: DispatchConfig,
    pub actions: ActionRegistry,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            dispatch: DispatchConfig::default(),
            actions: ActionRegistry::with_builtins(),
        }
    }
}

pub struct Dispatcher {
    store: SharedRecordStore,
    identity: IdentityResolver,
    normalizer: Normalizer,
    hooks: Hooks,
    sender: Arc<OutboundSender>,
    media_failure: MediaFailurePolicy,
    ack_sender: SendContext,
}

/// Commit tries per delivery; the retry re-reads what a concurrent delivery created.
const COMMIT_ATTEMPTS: usize = 2;

/// Staged results of the messages of one delivery.
#[derive(Default)]
struct Batch {
    changes: ChangeSet,
    persisted: usize,
    acks: Vec<String>,
}

impl Dispatcher {
    pub fn new(
        store: SharedRecordStore,
        normalizer: Normalizer,
        sender: Arc<OutboundSender>,
        settings: DispatchSettings,
    ) -> Self {
        let DispatchSettings {
            identity,
            dispatch,
            actions,
        } = settings;
        let default_priority = identity.default_priority;
        Self {
            store,
            identity: IdentityResolver::new(identity),
            normalizer,
            media_failure: dispatch.media_failure,
            ack_sender: SendContext::new(dispatch.ack_sender_name.clone()),
            hooks: Hooks::new(dispatch, actions, default_priority),
            sender,
        }
    }

    /// Handles one webhook POST. Never fails: the outcome only feeds logs and metrics.
    pub async fn handle_update(&self, request: UpdateRequest<'_>) -> DispatchOutcome {
        let span = start_update_span(request.usage, request.token);
        let outcome = self.process(request).instrument(span.clone()).await;
        span.record("outcome", outcome.label());
        record_update_outcome(outcome.label());
        outcome
    }

    /// Subscription handshake; returns the challenge to echo when the verify token matches.
    pub async fn handle_subscription(
        &self,
        usage: &str,
        token: &str,
        verify_token: Option<&str>,
        challenge: Option<&str>,
    ) -> Option<String> {
        let gateway = match self.store.gateway(token, usage).await {
            Ok(Some(gateway)) => gateway,
            Ok(None) => {
                warn!(gateway = token, usage, "handshake for unknown gateway");
                return None;
            }
            Err(err) => {
                error!(error = %err, gateway = token, "gateway lookup failed");
                return None;
            }
        };
        let echo = security::accept_challenge(&gateway.verify_token, verify_token, challenge)?;
        if !gateway.is_integrated() {
            if let Err(err) = self
                .store
                .set_gateway_state(&gateway.id, GatewayState::Integrated)
                .await
            {
                error!(error = %err, gateway = token, "unable to mark gateway integrated");
                return None;
            }
            info!(gateway = token, usage, "gateway integrated");
        }
        Some(echo)
    }

    /// Puts a gateway back in `pending` until the provider repeats the handshake.
    pub async fn reset_webhook(&self, gateway_id: &str) -> Result<Gateway, StoreError> {
        let gateway = self
            .store
            .set_gateway_state(gateway_id, GatewayState::Pending)
            .await?;
        info!(gateway = %gateway.token, "webhook reset, waiting for handshake");
        Ok(gateway)
    }

    async fn process(&self, request: UpdateRequest<'_>) -> DispatchOutcome {
        let payload: WebhookPayload = match serde_json::from_slice(request.body) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "webhook body is not valid json");
                return DispatchOutcome::Malformed;
            }
        };
        let value = match payload.first_value() {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "malformed webhook payload dropped");
                return DispatchOutcome::Malformed;
            }
        };
        if payload.is_status_only() {
            debug!("status update, not processing further");
            return DispatchOutcome::StatusOnly;
        }

        if let Some(first) = value.messages.first().filter(|m| !m.id.is_empty()) {
            match self.store.message_exists(&first.id).await {
                Ok(true) => {
                    debug!(msg_id = %first.id, "duplicate delivery ignored");
                    return DispatchOutcome::Duplicate;
                }
                Ok(false) => {}
                Err(err) => {
                    error!(error = %err, "replay check failed");
                    return DispatchOutcome::Failed;
                }
            }
        }

        let gateway = match self.store.gateway(request.token, request.usage).await {
            Ok(Some(gateway)) if gateway.is_integrated() => gateway,
            Ok(_) => {
                warn!(
                    gateway = request.token,
                    usage = request.usage,
                    "gateway was not found for token"
                );
                return DispatchOutcome::UnknownGateway;
            }
            Err(err) => {
                error!(error = %err, "gateway lookup failed");
                return DispatchOutcome::Failed;
            }
        };

        if !security::verify_signature(&gateway.webhook_secret, request.body, request.signature)
        {
            warn!(
                gateway = request.token,
                usage = request.usage,
                "message could not be verified"
            );
            return DispatchOutcome::Unauthenticated;
        }

        let ctx = RequestContext::new(gateway);
        let mut attempt = 1;
        loop {
            let Ok(batch) = self.stage(&ctx, &payload).await else {
                return DispatchOutcome::Failed;
            };
            let Batch {
                changes,
                persisted,
                acks,
            } = batch;
            if !changes.is_empty() {
                match self.store.commit(changes).await {
                    Ok(()) => {}
                    Err(StoreError::DuplicateMessage(id)) => {
                        debug!(msg_id = %id, "concurrent delivery already stored");
                        return DispatchOutcome::Duplicate;
                    }
                    Err(StoreError::Conflict(what)) if attempt < COMMIT_ATTEMPTS => {
                        // a concurrent delivery created the same channel or link first
                        warn!(%what, attempt, "update raced another delivery, restaging");
                        attempt += 1;
                        continue;
                    }
                    Err(err) => {
                        error!(error = %err, "unable to persist update");
                        return DispatchOutcome::Failed;
                    }
                }
            }
            record_persisted(persisted);
            self.send_acks(&ctx.gateway, &acks).await;
            return DispatchOutcome::Processed { persisted };
        }
    }

    /// Stages every message of the delivery from fresh reads.
    async fn stage(
        &self,
        ctx: &RequestContext,
        payload: &WebhookPayload,
    ) -> Result<Batch, DispatchError> {
        let mut batch = Batch::default();
        for (value, message) in payload.messages() {
            let span = start_message_span(&message.from, &message.id);
            self.process_message(ctx, value, message, &mut batch)
                .instrument(span)
                .await
                .inspect_err(|err| {
                    error!(error = %err, msg_id = %message.id, "update processing aborted");
                })?;
        }
        Ok(batch)
    }

    async fn process_message(
        &self,
        ctx: &RequestContext,
        value: &ChangeValue,
        message: &InboundMessage,
        batch: &mut Batch,
    ) -> Result<(), DispatchError> {
        let store = self.store.as_ref();
        if !message.id.is_empty()
            && (batch.changes.has_provider_message(&message.id)
                || store.message_exists(&message.id).await?)
        {
            debug!("message already stored, skipping");
            return Ok(());
        }
        let gateway = &ctx.gateway;
        let profile_name = value.profile_name(&message.from);
        let channel = self
            .channel(gateway, &message.from, profile_name, ctx.received_at, &mut batch.changes)
            .await?;

        let normalized = match self
            .normalizer
            .normalize(&gateway.credentials, message)
            .await
        {
            Ok(normalized) => normalized,
            Err(err) if self.media_failure == MediaFailurePolicy::Skip => {
                warn!(error = %err, "keeping message without the failed media");
                err.partial
            }
            Err(err) => return Err(err.into()),
        };

        let parent = match message.reply_to() {
            Some(reference) => self.parent(&channel, reference, &batch.changes).await?,
            None => None,
        };

        let actor = self
            .identity
            .resolve(store, &mut batch.changes, gateway, &message.from, profile_name)
            .await?;

        let mut record = (!normalized.is_empty()).then(|| Message {
            id: new_id(),
            thread: ThreadRef::channel(channel.id.clone()),
            direction: Direction::Inbound,
            body: normalized.body,
            attachments: normalized.attachments,
            provider_message_id: Some(message.id.clone()).filter(|id| !id.is_empty()),
            parent_id: parent.as_ref().map(|p| p.id.clone()),
            author: Some(actor.author_ref()),
            date: message_date(message).unwrap_or(ctx.received_at),
            from_webhook: true,
            mirror_id: None,
            delivery: None,
        });

        let input = HookInput {
            channel: &channel,
            message,
            actor: &actor,
            persisted: record.as_ref(),
            now: ctx.received_at,
        };
        let report = self.hooks.run(store, &mut batch.changes, &input).await?;
        batch.acks.extend(report.ack_message);

        if let Some(record) = record.as_mut() {
            if let Some(parent) = &parent {
                mirror_reply(store, &mut batch.changes, parent, record).await?;
            }
            info!(message = %record.id, channel_id = %channel.id, "inbound message stored");
        }
        if let Some(record) = record {
            batch.changes.put(record);
            batch.persisted += 1;
        } else {
            debug!(kind = %message.kind, "nothing to store for message");
        }
        Ok(())
    }

    async fn channel(
        &self,
        gateway: &Gateway,
        token: &str,
        profile_name: Option<&str>,
        now: OffsetDateTime,
        changes: &mut ChangeSet,
    ) -> Result<Channel, StoreError> {
        if let Some(channel) = changes.channel(&gateway.id, token) {
            return Ok(channel.clone());
        }
        if let Some(channel) = self.store.channel(&gateway.id, token).await? {
            return Ok(channel);
        }
        let channel = Channel {
            id: new_id(),
            gateway_id: gateway.id.clone(),
            gateway_channel_token: token.to_string(),
            name: profile_name.unwrap_or(token).to_string(),
            created_at: now,
        };
        info!(channel_id = %channel.id, "new conversation");
        changes.put(channel.clone());
        Ok(channel)
    }

    /// Message of the same conversation a reply points at, stored or staged
    /// earlier in the same delivery.
    async fn parent(
        &self,
        channel: &Channel,
        reference: &str,
        changes: &ChangeSet,
    ) -> Result<Option<Message>, StoreError> {
        let thread = ThreadRef::channel(channel.id.clone());
        if let Some(found) = self.store.message_by_provider_ref(&thread, reference).await? {
            return Ok(Some(found));
        }
        Ok(changes
            .messages()
            .into_iter()
            .find(|m| {
                m.thread == thread
                    && m.provider_message_id
                        .as_deref()
                        .is_some_and(|id| id.eq_ignore_ascii_case(reference))
            })
            .cloned())
    }

    async fn send_acks(&self, gateway: &Gateway, acks: &[String]) {
        for message_id in acks {
            if let Err(err) = self
                .sender
                .send(&self.ack_sender, gateway, message_id, SendMode::Lenient)
                .await
            {
                warn!(error = %err, message = %message_id, "acknowledgement not sent");
            }
        }
    }
}

fn message_date(message: &InboundMessage) -> Option<OffsetDateTime> {
    let seconds: i64 = message.timestamp.as_deref()?.trim().parse().ok()?;
    OffsetDateTime::from_unix_timestamp(seconds).ok()
}

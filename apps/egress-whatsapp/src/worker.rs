use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use gwb_core::platforms::whatsapp::{DeliveryOutcome, OutboundSender, SendError, SendMode};
use gwb_core::store::{ChangeSet, SharedRecordStore, StoreError};
use gwb_core::{AuthorRef, Delivery, Gateway, Message, NotificationStatus, SendContext};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct EgressWorker {
    store: SharedRecordStore,
    sender: Arc<OutboundSender>,
    batch: usize,
    mode: SendMode,
    sender_name: String,
}

impl EgressWorker {
    pub fn new(
        store: SharedRecordStore,
        sender: Arc<OutboundSender>,
        batch: usize,
        mode: SendMode,
        sender_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            sender,
            batch,
            mode,
            sender_name: sender_name.into(),
        }
    }

    /// Sends up to one batch of waiting messages.
    pub async fn drain_once(&self) -> Result<DrainReport, StoreError> {
        let mut report = DrainReport::default();
        for message in self.store.pending_deliveries(self.batch).await? {
            let Some(gateway) = self.gateway_for(&message).await? else {
                self.abandon(&message, "message has no deliverable channel")
                    .await?;
                report.failed += 1;
                continue;
            };
            let ctx = SendContext::new(self.author_name(&message).await?);
            match self
                .sender
                .send(&ctx, &gateway, &message.id, self.mode)
                .await
            {
                Ok(DeliveryOutcome::Sent { .. }) => report.sent += 1,
                Ok(DeliveryOutcome::Failed { .. }) => report.failed += 1,
                Ok(DeliveryOutcome::Skipped) => report.skipped += 1,
                Err(SendError::Store(err)) => return Err(err),
                Err(SendError::Delivery { reason }) => {
                    // failed sends are never retried
                    self.abandon(&message, &reason).await?;
                    report.failed += 1;
                }
                Err(err) => {
                    warn!(message = %message.id, error = %err, "message rejected");
                    report.failed += 1;
                }
            }
        }
        if report != DrainReport::default() {
            info!(
                sent = report.sent,
                failed = report.failed,
                skipped = report.skipped,
                "egress pass finished"
            );
        }
        Ok(report)
    }

    /// Polls until `shutdown` resolves.
    pub async fn run(&self, poll: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("egress worker stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.drain_once().await {
                        error!(error = %err, "egress pass failed");
                    }
                }
            }
        }
    }

    async fn gateway_for(&self, message: &Message) -> Result<Option<Gateway>, StoreError> {
        let Some(channel_id) = message.channel_id() else {
            return Ok(None);
        };
        let Some(channel) = self.store.channel_by_id(channel_id).await? else {
            return Ok(None);
        };
        self.store.gateway_by_id(&channel.gateway_id).await
    }

    async fn author_name(&self, message: &Message) -> Result<String, StoreError> {
        if let Some(AuthorRef::Contact(contact_id)) = &message.author {
            if let Some(contact) = self.store.contact(contact_id).await? {
                return Ok(contact.name);
            }
            debug!(contact = %contact_id, "author contact missing, using default signature");
        }
        Ok(self.sender_name.clone())
    }

    async fn abandon(&self, message: &Message, reason: &str) -> Result<(), StoreError> {
        warn!(message = %message.id, reason, "outbound message cannot be delivered");
        let mut message = message.clone();
        message.delivery = Some(Delivery {
            status: NotificationStatus::Exception,
            failure_reason: Some(reason.to_string()),
        });
        let mut changes = ChangeSet::new();
        changes.put(message);
        self.store.commit(changes).await
    }
}

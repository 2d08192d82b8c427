//! Side effects fired for every inbound message, in order: CRM transition,
//! queue assignment, button action.

use gwb_core::platforms::whatsapp::InboundMessage;
use gwb_core::store::{ChangeSet, RecordStore, Result};
use gwb_core::text::sanitize_phone;
use gwb_core::{
    ActionRegistry, Actor, ButtonParams, Channel, DispatchConfig, LeadStatus, Message,
    QueueEntry, QueueState, new_id,
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// What the hooks know about the message being processed.
pub struct HookInput<'a> {
    pub channel: &'a Channel,
    pub message: &'a InboundMessage,
    pub actor: &'a Actor,
    /// The stored record, when the message had content worth persisting.
    pub persisted: Option<&'a Message>,
    pub now: OffsetDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookReport {
    pub leads_advanced: usize,
    pub queue_entry: Option<String>,
    /// Outbound acknowledgement staged for delivery once the changes are committed.
    pub ack_message: Option<String>,
    pub action: Option<String>,
}

pub struct Hooks {
    config: DispatchConfig,
    actions: ActionRegistry,
    /// Queue priority of senders that are not contacts.
    default_priority: u8,
}

impl Hooks {
    pub fn new(config: DispatchConfig, actions: ActionRegistry, default_priority: u8) -> Self {
        Self {
            config,
            actions,
            default_priority,
        }
    }

    pub async fn run(
        &self,
        store: &dyn RecordStore,
        changes: &mut ChangeSet,
        input: &HookInput<'_>,
    ) -> Result<HookReport> {
        let mut report = HookReport {
            leads_advanced: self.advance_leads(store, changes, input).await?,
            ..HookReport::default()
        };
        if let Some((entry, ack)) = self.enqueue(store, changes, input).await? {
            report.queue_entry = Some(entry);
            report.ack_message = ack;
        }
        report.action = self.run_button_action(store, changes, input).await?;
        Ok(report)
    }

    /// Draft leads of the sender whose button offer is still pending move to in progress.
    async fn advance_leads(
        &self,
        store: &dyn RecordStore,
        changes: &mut ChangeSet,
        input: &HookInput<'_>,
    ) -> Result<usize> {
        if input.persisted.is_none() {
            return Ok(0);
        }
        let Some(number) = sanitize_phone(&input.message.from) else {
            return Ok(0);
        };
        let leads = changes.overlay_leads(store.leads_for_mobile(&number).await?);
        let mut advanced = 0;
        for mut lead in leads.into_iter().filter(|lead| lead.is_open_draft()) {
            lead.status = LeadStatus::InProgress;
            lead.button_consumed = true;
            info!(lead = %lead.id, "lead moved to in progress");
            changes.put(lead);
            advanced += 1;
        }
        Ok(advanced)
    }

    fn is_terminal(&self, message: &InboundMessage) -> bool {
        message.is_button()
            && [message.button_text(), message.button_payload()]
                .into_iter()
                .flatten()
                .any(|value| self.config.is_terminal(value))
    }

    async fn enqueue(
        &self,
        store: &dyn RecordStore,
        changes: &mut ChangeSet,
        input: &HookInput<'_>,
    ) -> Result<Option<(String, Option<String>)>> {
        if !self.config.queue_enabled || input.persisted.is_none() {
            return Ok(None);
        }
        if self.is_terminal(input.message) {
            debug!(channel_id = %input.channel.id, "terminal button reply, not queueing");
            return Ok(None);
        }
        let active = match changes.queue_entry_for_channel(&input.channel.id) {
            Some(staged) => staged.is_active(),
            None => store
                .active_queue_entry(&input.channel.id)
                .await?
                .is_some(),
        };
        if active {
            return Ok(None);
        }

        let entry = QueueEntry {
            id: new_id(),
            channel_id: input.channel.id.clone(),
            author: Some(input.actor.author_ref()),
            priority: input.actor.priority().unwrap_or(self.default_priority),
            state: QueueState::Waiting,
            created_at: input.now,
        };
        info!(channel_id = %input.channel.id, entry = %entry.id, priority = entry.priority, "conversation queued");
        let entry_id = entry.id.clone();
        changes.put(entry);

        let ack = self.config.ack_body.as_deref().filter(|body| !body.is_empty()).map(|body| {
            let mut ack = Message::outbound(&input.channel.id, body, input.now);
            // delivered by the dispatcher right after the commit
            ack.delivery = None;
            let id = ack.id.clone();
            changes.put(ack);
            id
        });
        Ok(Some((entry_id, ack)))
    }

    async fn run_button_action(
        &self,
        store: &dyn RecordStore,
        changes: &mut ChangeSet,
        input: &HookInput<'_>,
    ) -> Result<Option<String>> {
        let message = input.message;
        let Some(payload) = message.button_payload() else {
            return Ok(None);
        };
        let Some(reply_to) = message.reply_to() else {
            warn!(payload, "button reply without context, no template to resolve");
            return Ok(None);
        };
        let Some(template) = store.template_for_provider_message(reply_to).await? else {
            warn!(payload, reply_to, "button reply to a message no template produced");
            return Ok(None);
        };
        let Some(binding) = store.button_binding(&template.id, payload).await? else {
            warn!(payload, template = %template.name, "button template not found");
            return Ok(None);
        };
        let Some(action) = self.actions.get(&binding.action) else {
            warn!(action = %binding.action, "button bound to an unregistered action");
            return Ok(None);
        };

        let params = ButtonParams {
            sender_number: message.from.clone(),
            channel_id: input.channel.id.clone(),
        };
        let mut staged = changes.clone();
        match action.run(store, &params, &mut staged).await {
            Ok(()) => {
                *changes = staged;
                info!(action = %binding.action, "button action applied");
                Ok(Some(binding.action))
            }
            Err(err) => {
                warn!(action = %binding.action, error = %err, "button action failed");
                Ok(None)
            }
        }
    }
}

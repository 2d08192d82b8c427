//! Named handlers invoked when a template button reply arrives.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::store::{ChangeSet, RecordStore, StoreError};
use crate::text::sanitize_phone;
use crate::types::{LeadStatus, QueueState};

pub const LEAD_CONFIRM: &str = "lead.confirm";
pub const LEAD_CANCEL: &str = "lead.cancel";
pub const QUEUE_CLOSE: &str = "queue.close";

/// What an action learns about the button press: who pressed it and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonParams {
    /// Lead actions match the sender's open lead by this number.
    pub sender_number: String,
    /// Queue actions act on this conversation.
    pub channel_id: String,
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("action rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait ButtonAction: Send + Sync {
    /// Stages the action's effects into `changes`; nothing is written directly.
    async fn run(
        &self,
        store: &dyn RecordStore,
        params: &ButtonParams,
        changes: &mut ChangeSet,
    ) -> Result<(), ActionError>;
}

/// Closed set of actions a button binding may name.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<String, Arc<dyn ButtonAction>>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register(LEAD_CONFIRM, LeadTransition::new(LeadStatus::Confirmed))
            .register(LEAD_CANCEL, LeadTransition::new(LeadStatus::Cancelled))
            .register(QUEUE_CLOSE, CloseQueue);
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        action: impl ButtonAction + 'static,
    ) -> &mut Self {
        self.actions.insert(name.into(), Arc::new(action));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ButtonAction>> {
        self.actions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }
}

/// Moves the sender's most recent open lead to a final status.
pub struct LeadTransition {
    target: LeadStatus,
}

impl LeadTransition {
    pub fn new(target: LeadStatus) -> Self {
        Self { target }
    }
}

#[async_trait]
impl ButtonAction for LeadTransition {
    async fn run(
        &self,
        store: &dyn RecordStore,
        params: &ButtonParams,
        changes: &mut ChangeSet,
    ) -> Result<(), ActionError> {
        let Some(number) = sanitize_phone(&params.sender_number) else {
            return Err(ActionError::Rejected(format!(
                "sender `{}` has no phone digits",
                params.sender_number
            )));
        };
        let leads = changes.overlay_leads(store.leads_for_mobile(&number).await?);
        let open = leads
            .into_iter()
            .find(|lead| matches!(lead.status, LeadStatus::Draft | LeadStatus::InProgress));
        let Some(mut lead) = open else {
            debug!(sender = %number, "no open lead for button reply");
            return Ok(());
        };
        lead.status = self.target;
        lead.button_consumed = true;
        info!(lead = %lead.id, status = ?lead.status, "lead updated from button reply");
        changes.put(lead);
        Ok(())
    }
}

/// Closes the active queue entry of the conversation.
pub struct CloseQueue;

#[async_trait]
impl ButtonAction for CloseQueue {
    async fn run(
        &self,
        store: &dyn RecordStore,
        params: &ButtonParams,
        changes: &mut ChangeSet,
    ) -> Result<(), ActionError> {
        let staged = changes
            .queue_entry_for_channel(&params.channel_id)
            .cloned();
        let entry = match staged {
            Some(entry) => Some(entry),
            None => store.active_queue_entry(&params.channel_id).await?,
        };
        if let Some(mut entry) = entry.filter(|e| e.is_active()) {
            entry.state = QueueState::Closed;
            changes.put(entry);
        }
        Ok(())
    }
}

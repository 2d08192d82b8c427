//! Persistence contract for gateway records.
//!
//! Every inbound delivery is applied as one [`ChangeSet`] through
//! [`RecordStore::commit`]; either all of its records land or none do.

use anyhow::Error;
use std::sync::Arc;
use thiserror::Error;

use crate::types::{
    ButtonBinding, Channel, Contact, DeliveryAttempt, Gateway, GatewayState, Guest, IdentityLink,
    Lead, Message, QueueEntry, Template, TemplateSend, ThreadRef,
};

mod memory;
#[cfg(feature = "store_sqlite")]
mod sqlite;

pub use memory::InMemoryStore;
#[cfg(feature = "store_sqlite")]
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("provider message id already stored: {0}")]
    DuplicateMessage(String),
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("record serialization failed")]
    Serialization(#[from] serde_json::Error),
    #[error("record store error")]
    Internal(#[source] Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub type SharedRecordStore = Arc<dyn RecordStore>;

/// A record staged for the next commit.
#[derive(Debug, Clone)]
pub enum Record {
    Gateway(Gateway),
    Channel(Channel),
    Message(Message),
    Contact(Contact),
    Guest(Guest),
    IdentityLink(IdentityLink),
    Lead(Lead),
    QueueEntry(QueueEntry),
    Template(Template),
    TemplateSend(TemplateSend),
    ButtonBinding(ButtonBinding),
    DeliveryAttempt(DeliveryAttempt),
}

impl Record {
    pub fn id(&self) -> &str {
        match self {
            Record::Gateway(r) => &r.id,
            Record::Channel(r) => &r.id,
            Record::Message(r) => &r.id,
            Record::Contact(r) => &r.id,
            Record::Guest(r) => &r.id,
            Record::IdentityLink(r) => &r.id,
            Record::Lead(r) => &r.id,
            Record::QueueEntry(r) => &r.id,
            Record::Template(r) => &r.id,
            Record::TemplateSend(r) => &r.id,
            Record::ButtonBinding(r) => &r.id,
            Record::DeliveryAttempt(r) => &r.id,
        }
    }
}

macro_rules! record_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Record {
                fn from(value: $variant) -> Self {
                    Record::$variant(value)
                }
            }
        )*
    };
}

record_from!(
    Gateway,
    Channel,
    Message,
    Contact,
    Guest,
    IdentityLink,
    Lead,
    QueueEntry,
    Template,
    TemplateSend,
    ButtonBinding,
    DeliveryAttempt,
);

/// Ordered batch of upserts. Later puts of the same id supersede earlier ones.
///
/// The lookup helpers answer from staged records only, newest first, so a
/// batch stays consistent with itself before it reaches the store.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    records: Vec<Record>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, record: impl Into<Record>) {
        self.records.push(record.into());
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn extend(&mut self, other: ChangeSet) {
        self.records.extend(other.records);
    }

    /// Staged messages in staging order, one entry per id.
    pub fn messages(&self) -> Vec<&Message> {
        let mut seen = Vec::<&str>::new();
        let mut out = Vec::new();
        for record in self.records.iter().rev() {
            if let Record::Message(message) = record {
                if !seen.contains(&message.id.as_str()) {
                    seen.push(&message.id);
                    out.push(message);
                }
            }
        }
        out.reverse();
        out
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.find(|r| match r {
            Record::Message(m) if m.id == id => Some(m),
            _ => None,
        })
    }

    pub fn has_provider_message(&self, provider_message_id: &str) -> bool {
        self.find(|r| match r {
            Record::Message(m) if m.provider_message_id.as_deref() == Some(provider_message_id) => {
                Some(m)
            }
            _ => None,
        })
        .is_some()
    }

    pub fn channel(&self, gateway_id: &str, token: &str) -> Option<&Channel> {
        self.find(|r| match r {
            Record::Channel(c) if c.gateway_id == gateway_id && c.gateway_channel_token == token => {
                Some(c)
            }
            _ => None,
        })
    }

    pub fn identity_link(&self, gateway_id: &str, token: &str) -> Option<&IdentityLink> {
        self.find(|r| match r {
            Record::IdentityLink(l) if l.gateway_id == gateway_id && l.gateway_token == token => {
                Some(l)
            }
            _ => None,
        })
    }

    pub fn contact(&self, id: &str) -> Option<&Contact> {
        self.find(|r| match r {
            Record::Contact(c) if c.id == id => Some(c),
            _ => None,
        })
    }

    pub fn contact_by_phone(&self, sanitized: &str) -> Option<&Contact> {
        self.find(|r| match r {
            Record::Contact(c) if c.matches_phone(sanitized) => Some(c),
            _ => None,
        })
    }

    pub fn guest_by_token(&self, gateway_id: &str, token: &str) -> Option<&Guest> {
        self.find(|r| match r {
            Record::Guest(g) if g.gateway_id == gateway_id && g.gateway_token == token => Some(g),
            _ => None,
        })
    }

    pub fn lead(&self, id: &str) -> Option<&Lead> {
        self.find(|r| match r {
            Record::Lead(l) if l.id == id => Some(l),
            _ => None,
        })
    }

    pub fn queue_entry(&self, id: &str) -> Option<&QueueEntry> {
        self.find(|r| match r {
            Record::QueueEntry(q) if q.id == id => Some(q),
            _ => None,
        })
    }

    /// Latest staged entry of a channel, closed or not.
    pub fn queue_entry_for_channel(&self, channel_id: &str) -> Option<&QueueEntry> {
        self.find(|r| match r {
            Record::QueueEntry(q) if q.channel_id == channel_id => Some(q),
            _ => None,
        })
    }

    /// Replaces stored leads with their staged versions.
    pub fn overlay_leads(&self, leads: Vec<Lead>) -> Vec<Lead> {
        leads
            .into_iter()
            .map(|lead| self.lead(&lead.id).cloned().unwrap_or(lead))
            .collect()
    }

    fn find<'a, T>(&'a self, pick: impl Fn(&'a Record) -> Option<&'a T>) -> Option<&'a T> {
        self.records.iter().rev().find_map(pick)
    }
}

#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Gateway owning `(token, gateway_type)`, integrated ones first.
    async fn gateway(&self, token: &str, gateway_type: &str) -> Result<Option<Gateway>>;
    async fn gateway_by_id(&self, id: &str) -> Result<Option<Gateway>>;
    async fn gateways(&self) -> Result<Vec<Gateway>>;

    async fn channel(&self, gateway_id: &str, token: &str) -> Result<Option<Channel>>;
    async fn channel_by_id(&self, id: &str) -> Result<Option<Channel>>;

    async fn message(&self, id: &str) -> Result<Option<Message>>;
    async fn message_exists(&self, provider_message_id: &str) -> Result<bool>;
    /// Message of `thread` whose provider id is `reference`, else the most recent one
    /// whose provider id starts with it. Case is ignored.
    async fn message_by_provider_ref(
        &self,
        thread: &ThreadRef,
        reference: &str,
    ) -> Result<Option<Message>>;
    /// Messages of a thread, newest first.
    async fn thread_messages(&self, thread: &ThreadRef) -> Result<Vec<Message>>;
    /// Outbound messages still waiting for delivery, oldest first.
    async fn pending_deliveries(&self, limit: usize) -> Result<Vec<Message>>;

    async fn identity_link(&self, gateway_id: &str, token: &str) -> Result<Option<IdentityLink>>;
    async fn contact(&self, id: &str) -> Result<Option<Contact>>;
    /// Contact whose phone or mobile normalizes to `sanitized`.
    async fn contact_by_phone(&self, sanitized: &str) -> Result<Option<Contact>>;
    async fn guest(&self, id: &str) -> Result<Option<Guest>>;
    async fn guest_by_token(&self, gateway_id: &str, token: &str) -> Result<Option<Guest>>;

    /// Leads whose mobile normalizes to `sanitized`, newest first.
    async fn leads_for_mobile(&self, sanitized: &str) -> Result<Vec<Lead>>;
    async fn active_queue_entry(&self, channel_id: &str) -> Result<Option<QueueEntry>>;

    async fn template(&self, name: &str) -> Result<Option<Template>>;
    /// Template whose recorded send produced a provider id starting with `reference`.
    async fn template_for_provider_message(&self, reference: &str) -> Result<Option<Template>>;
    async fn button_binding(&self, template_id: &str, payload: &str)
    -> Result<Option<ButtonBinding>>;
    async fn button_bindings(&self) -> Result<Vec<ButtonBinding>>;

    /// Attempts recorded for a message, oldest first.
    async fn delivery_attempts(&self, message_id: &str) -> Result<Vec<DeliveryAttempt>>;

    /// Applies every staged record atomically.
    async fn commit(&self, changes: ChangeSet) -> Result<()>;

    async fn set_gateway_state(&self, id: &str, state: GatewayState) -> Result<Gateway> {
        let mut gateway = self
            .gateway_by_id(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("gateway {id}")))?;
        gateway.state = state;
        let mut changes = ChangeSet::new();
        changes.put(gateway.clone());
        self.commit(changes).await?;
        Ok(gateway)
    }
}

/// Opens the configured store; `:memory:` keeps everything in process.
pub fn open_store(location: &str) -> anyhow::Result<SharedRecordStore> {
    if location == ":memory:" {
        return Ok(InMemoryStore::shared());
    }
    open_persistent(location)
}

#[cfg(feature = "store_sqlite")]
fn open_persistent(location: &str) -> anyhow::Result<SharedRecordStore> {
    Ok(Arc::new(SqliteStore::open(location)?))
}

#[cfg(not(feature = "store_sqlite"))]
fn open_persistent(location: &str) -> anyhow::Result<SharedRecordStore> {
    anyhow::bail!("persistent store `{location}` requires the store_sqlite feature")
}

/// Case-insensitive prefix match used for provider id references.
pub(crate) fn matches_provider_ref(provider_message_id: &str, reference: &str) -> bool {
    !reference.is_empty()
        && provider_message_id.len() >= reference.len()
        && provider_message_id.is_char_boundary(reference.len())
        && provider_message_id[..reference.len()].eq_ignore_ascii_case(reference)
}

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

use super::{ChangeSet, Record, RecordStore, Result, SharedRecordStore, StoreError};
use crate::store::matches_provider_ref;
use crate::types::{
    ButtonBinding, Channel, Contact, DeliveryAttempt, Direction, Gateway, Guest, IdentityLink,
    Lead, Message, NotificationStatus, QueueEntry, Template, TemplateSend, ThreadRef,
};
use crate::text::sanitize_phone;

#[derive(Debug, Clone)]
struct Row<T> {
    seq: u64,
    record: T,
}

type Table<T> = HashMap<String, Row<T>>;

#[derive(Debug, Default)]
struct Tables {
    next_seq: u64,
    gateways: Table<Gateway>,
    channels: Table<Channel>,
    messages: Table<Message>,
    contacts: Table<Contact>,
    guests: Table<Guest>,
    links: Table<IdentityLink>,
    leads: Table<Lead>,
    queue: Table<QueueEntry>,
    templates: Table<Template>,
    template_sends: Table<TemplateSend>,
    bindings: Table<ButtonBinding>,
    attempts: Table<DeliveryAttempt>,
}

/// Reverts one applied record.
type Undo = Box<dyn FnOnce(&mut Tables) + Send>;

/// Inserts or replaces `id`, returning the record it replaced.
fn upsert<T>(table: &mut Table<T>, next_seq: &mut u64, id: &str, record: T) -> Option<T> {
    match table.get_mut(id) {
        Some(row) => Some(std::mem::replace(&mut row.record, record)),
        None => {
            *next_seq += 1;
            table.insert(
                id.to_string(),
                Row {
                    seq: *next_seq,
                    record,
                },
            );
            None
        }
    }
}

fn revert<T: Send + 'static>(
    previous: Option<T>,
    id: String,
    table: fn(&mut Tables) -> &mut Table<T>,
) -> Undo {
    Box::new(move |tables| {
        let table = table(tables);
        match previous {
            Some(record) => {
                if let Some(row) = table.get_mut(&id) {
                    row.record = record;
                }
            }
            None => {
                table.remove(&id);
            }
        }
    })
}

fn others<'a, T>(table: &'a Table<T>, id: &'a str) -> impl Iterator<Item = &'a T> + 'a {
    table
        .iter()
        .filter(move |(key, _)| key.as_str() != id)
        .map(|(_, row)| &row.record)
}

/// Records sorted by insertion, newest first.
fn newest_first<'a, T: Clone + 'a>(rows: impl Iterator<Item = &'a Row<T>>) -> Vec<T> {
    let mut rows: Vec<&Row<T>> = rows.collect();
    rows.sort_by(|a, b| b.seq.cmp(&a.seq));
    rows.into_iter().map(|row| row.record.clone()).collect()
}

impl Tables {
    /// Applies one record in place after its unique checks.
    fn apply(&mut self, record: Record) -> Result<Undo> {
        let undo = match record {
            Record::Gateway(gateway) => {
                if gateway.is_integrated()
                    && others(&self.gateways, &gateway.id).any(|g| {
                        g.is_integrated()
                            && g.token == gateway.token
                            && g.gateway_type == gateway.gateway_type
                    })
                {
                    return Err(StoreError::Conflict(format!(
                        "integrated gateway {}/{}",
                        gateway.gateway_type, gateway.token
                    )));
                }
                let id = gateway.id.clone();
                let previous = upsert(&mut self.gateways, &mut self.next_seq, &id, gateway);
                revert(previous, id, |t| &mut t.gateways)
            }
            Record::Channel(channel) => {
                if others(&self.channels, &channel.id).any(|c| {
                    c.gateway_id == channel.gateway_id
                        && c.gateway_channel_token == channel.gateway_channel_token
                }) {
                    return Err(StoreError::Conflict(format!(
                        "channel {}/{}",
                        channel.gateway_id, channel.gateway_channel_token
                    )));
                }
                let id = channel.id.clone();
                let previous = upsert(&mut self.channels, &mut self.next_seq, &id, channel);
                revert(previous, id, |t| &mut t.channels)
            }
            Record::Message(message) => {
                if let Some(provider_id) = message.provider_message_id.as_deref() {
                    if others(&self.messages, &message.id)
                        .any(|m| m.provider_message_id.as_deref() == Some(provider_id))
                    {
                        return Err(StoreError::DuplicateMessage(provider_id.to_string()));
                    }
                }
                let id = message.id.clone();
                let previous = upsert(&mut self.messages, &mut self.next_seq, &id, message);
                revert(previous, id, |t| &mut t.messages)
            }
            Record::Contact(contact) => {
                let id = contact.id.clone();
                let previous = upsert(&mut self.contacts, &mut self.next_seq, &id, contact);
                revert(previous, id, |t| &mut t.contacts)
            }
            Record::Guest(guest) => {
                let id = guest.id.clone();
                let previous = upsert(&mut self.guests, &mut self.next_seq, &id, guest);
                revert(previous, id, |t| &mut t.guests)
            }
            Record::IdentityLink(link) => {
                if others(&self.links, &link.id).any(|l| {
                    l.gateway_id == link.gateway_id && l.gateway_token == link.gateway_token
                }) {
                    return Err(StoreError::Conflict(format!(
                        "identity link {}/{}",
                        link.gateway_id, link.gateway_token
                    )));
                }
                let id = link.id.clone();
                let previous = upsert(&mut self.links, &mut self.next_seq, &id, link);
                revert(previous, id, |t| &mut t.links)
            }
            Record::Lead(lead) => {
                let id = lead.id.clone();
                let previous = upsert(&mut self.leads, &mut self.next_seq, &id, lead);
                revert(previous, id, |t| &mut t.leads)
            }
            Record::QueueEntry(entry) => {
                let id = entry.id.clone();
                let previous = upsert(&mut self.queue, &mut self.next_seq, &id, entry);
                revert(previous, id, |t| &mut t.queue)
            }
            Record::Template(template) => {
                if others(&self.templates, &template.id).any(|t| t.name == template.name) {
                    return Err(StoreError::Conflict(format!("template {}", template.name)));
                }
                let id = template.id.clone();
                let previous = upsert(&mut self.templates, &mut self.next_seq, &id, template);
                revert(previous, id, |t| &mut t.templates)
            }
            Record::TemplateSend(send) => {
                let id = send.id.clone();
                let previous = upsert(&mut self.template_sends, &mut self.next_seq, &id, send);
                revert(previous, id, |t| &mut t.template_sends)
            }
            Record::ButtonBinding(binding) => {
                if others(&self.bindings, &binding.id)
                    .any(|b| b.template_id == binding.template_id && b.payload == binding.payload)
                {
                    return Err(StoreError::Conflict(format!(
                        "button binding {}/{}",
                        binding.template_id, binding.payload
                    )));
                }
                let id = binding.id.clone();
                let previous = upsert(&mut self.bindings, &mut self.next_seq, &id, binding);
                revert(previous, id, |t| &mut t.bindings)
            }
            Record::DeliveryAttempt(attempt) => {
                let id = attempt.id.clone();
                let previous = upsert(&mut self.attempts, &mut self.next_seq, &id, attempt);
                revert(previous, id, |t| &mut t.attempts)
            }
        };
        Ok(undo)
    }
}

/// Process-local store used by tests and `:memory:` deployments.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRecordStore {
        Arc::new(Self::new())
    }
}

#[async_trait::async_trait]
impl RecordStore for InMemoryStore {
    async fn gateway(&self, token: &str, gateway_type: &str) -> Result<Option<Gateway>> {
        let guard = self.inner.read().await;
        let mut matches: Vec<Gateway> = newest_first(guard.gateways.values())
            .into_iter()
            .filter(|g| g.token == token && g.gateway_type == gateway_type)
            .collect();
        matches.sort_by_key(|g| !g.is_integrated());
        Ok(matches.into_iter().next())
    }

    async fn gateway_by_id(&self, id: &str) -> Result<Option<Gateway>> {
        let guard = self.inner.read().await;
        Ok(guard.gateways.get(id).map(|row| row.record.clone()))
    }

    async fn gateways(&self) -> Result<Vec<Gateway>> {
        let guard = self.inner.read().await;
        let mut all = newest_first(guard.gateways.values());
        all.reverse();
        Ok(all)
    }

    async fn channel(&self, gateway_id: &str, token: &str) -> Result<Option<Channel>> {
        let guard = self.inner.read().await;
        Ok(guard
            .channels
            .values()
            .map(|row| &row.record)
            .find(|c| c.gateway_id == gateway_id && c.gateway_channel_token == token)
            .cloned())
    }

    async fn channel_by_id(&self, id: &str) -> Result<Option<Channel>> {
        let guard = self.inner.read().await;
        Ok(guard.channels.get(id).map(|row| row.record.clone()))
    }

    async fn message(&self, id: &str) -> Result<Option<Message>> {
        let guard = self.inner.read().await;
        Ok(guard.messages.get(id).map(|row| row.record.clone()))
    }

    async fn message_exists(&self, provider_message_id: &str) -> Result<bool> {
        let guard = self.inner.read().await;
        Ok(guard
            .messages
            .values()
            .any(|row| row.record.provider_message_id.as_deref() == Some(provider_message_id)))
    }

    async fn message_by_provider_ref(
        &self,
        thread: &ThreadRef,
        reference: &str,
    ) -> Result<Option<Message>> {
        let guard = self.inner.read().await;
        let candidates: Vec<Message> = newest_first(
            guard
                .messages
                .values()
                .filter(|row| row.record.thread == *thread),
        )
        .into_iter()
        .filter(|m| {
            m.provider_message_id
                .as_deref()
                .is_some_and(|id| matches_provider_ref(id, reference))
        })
        .collect();
        let exact = candidates.iter().position(|m| {
            m.provider_message_id
                .as_deref()
                .is_some_and(|id| id.eq_ignore_ascii_case(reference))
        });
        Ok(match exact {
            Some(index) => candidates.into_iter().nth(index),
            None => candidates.into_iter().next(),
        })
    }

    async fn thread_messages(&self, thread: &ThreadRef) -> Result<Vec<Message>> {
        let guard = self.inner.read().await;
        Ok(newest_first(
            guard
                .messages
                .values()
                .filter(|row| &row.record.thread == thread),
        ))
    }

    async fn pending_deliveries(&self, limit: usize) -> Result<Vec<Message>> {
        let guard = self.inner.read().await;
        let mut pending = newest_first(guard.messages.values().filter(|row| {
            row.record.direction == Direction::Outbound
                && row.record.delivery_status() == Some(NotificationStatus::Ready)
        }));
        pending.reverse();
        pending.truncate(limit);
        Ok(pending)
    }

    async fn identity_link(&self, gateway_id: &str, token: &str) -> Result<Option<IdentityLink>> {
        let guard = self.inner.read().await;
        Ok(guard
            .links
            .values()
            .map(|row| &row.record)
            .find(|l| l.gateway_id == gateway_id && l.gateway_token == token)
            .cloned())
    }

    async fn contact(&self, id: &str) -> Result<Option<Contact>> {
        let guard = self.inner.read().await;
        Ok(guard.contacts.get(id).map(|row| row.record.clone()))
    }

    async fn contact_by_phone(&self, sanitized: &str) -> Result<Option<Contact>> {
        let guard = self.inner.read().await;
        let mut matches = newest_first(guard.contacts.values());
        matches.reverse();
        Ok(matches.into_iter().find(|c| c.matches_phone(sanitized)))
    }

    async fn guest(&self, id: &str) -> Result<Option<Guest>> {
        let guard = self.inner.read().await;
        Ok(guard.guests.get(id).map(|row| row.record.clone()))
    }

    async fn guest_by_token(&self, gateway_id: &str, token: &str) -> Result<Option<Guest>> {
        let guard = self.inner.read().await;
        Ok(guard
            .guests
            .values()
            .map(|row| &row.record)
            .find(|g| g.gateway_id == gateway_id && g.gateway_token == token)
            .cloned())
    }

    async fn leads_for_mobile(&self, sanitized: &str) -> Result<Vec<Lead>> {
        let guard = self.inner.read().await;
        Ok(newest_first(guard.leads.values())
            .into_iter()
            .filter(|l| sanitize_phone(&l.mobile).as_deref() == Some(sanitized))
            .collect())
    }

    async fn active_queue_entry(&self, channel_id: &str) -> Result<Option<QueueEntry>> {
        let guard = self.inner.read().await;
        Ok(newest_first(guard.queue.values())
            .into_iter()
            .find(|q| q.channel_id == channel_id && q.is_active()))
    }

    async fn template(&self, name: &str) -> Result<Option<Template>> {
        let guard = self.inner.read().await;
        Ok(guard
            .templates
            .values()
            .map(|row| &row.record)
            .find(|t| t.name == name)
            .cloned())
    }

    async fn template_for_provider_message(&self, reference: &str) -> Result<Option<Template>> {
        let guard = self.inner.read().await;
        let send = newest_first(guard.template_sends.values())
            .into_iter()
            .find(|s| {
                s.provider_message_id
                    .as_deref()
                    .is_some_and(|id| matches_provider_ref(id, reference))
            });
        Ok(send.and_then(|s| {
            guard
                .templates
                .get(&s.template_id)
                .map(|row| row.record.clone())
        }))
    }

    async fn button_binding(
        &self,
        template_id: &str,
        payload: &str,
    ) -> Result<Option<ButtonBinding>> {
        let guard = self.inner.read().await;
        Ok(guard
            .bindings
            .values()
            .map(|row| &row.record)
            .find(|b| b.template_id == template_id && b.payload == payload)
            .cloned())
    }

    async fn button_bindings(&self) -> Result<Vec<ButtonBinding>> {
        let guard = self.inner.read().await;
        let mut all = newest_first(guard.bindings.values());
        all.reverse();
        Ok(all)
    }

    async fn delivery_attempts(&self, message_id: &str) -> Result<Vec<DeliveryAttempt>> {
        let guard = self.inner.read().await;
        let mut attempts = newest_first(
            guard
                .attempts
                .values()
                .filter(|row| row.record.message_id == message_id),
        );
        attempts.reverse();
        Ok(attempts)
    }

    async fn commit(&self, changes: ChangeSet) -> Result<()> {
        let mut guard = self.inner.write().await;
        let next_seq = guard.next_seq;
        let mut journal: Vec<Undo> = Vec::new();
        for record in changes.into_records() {
            match guard.apply(record) {
                Ok(undo) => journal.push(undo),
                Err(err) => {
                    for undo in journal.into_iter().rev() {
                        undo(&mut *guard);
                    }
                    guard.next_seq = next_seq;
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GatewayState, LeadStatus, ProviderCredentials, new_id};
    use time::OffsetDateTime;

    fn gateway(state: GatewayState) -> Gateway {
        Gateway {
            id: new_id(),
            name: "wa".into(),
            token: "tok".into(),
            gateway_type: "whatsapp".into(),
            state,
            webhook_secret: "s".into(),
            verify_token: "v".into(),
            credentials: ProviderCredentials {
                bearer_token: "b".into(),
                api_version: "20.0".into(),
                from_phone: "1".into(),
            },
        }
    }

    fn inbound(provider_id: &str) -> Message {
        let mut message = Message::outbound("c1", "hi", OffsetDateTime::UNIX_EPOCH);
        message.direction = Direction::Inbound;
        message.delivery = None;
        message.provider_message_id = Some(provider_id.into());
        message
    }

    #[tokio::test]
    async fn commit_is_all_or_nothing() {
        let store = InMemoryStore::new();
        let mut first = ChangeSet::new();
        first.put(inbound("wamid.1"));
        store.commit(first).await.unwrap();

        let mut second = ChangeSet::new();
        second.put(inbound("wamid.2"));
        second.put(inbound("wamid.1"));
        let err = store.commit(second).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateMessage(id) if id == "wamid.1"));
        assert!(!store.message_exists("wamid.2").await.unwrap());
        assert!(store.message_exists("wamid.1").await.unwrap());
    }

    #[tokio::test]
    async fn gateway_lookup_prefers_integrated() {
        let store = InMemoryStore::new();
        let mut changes = ChangeSet::new();
        changes.put(gateway(GatewayState::Pending));
        let live = gateway(GatewayState::Integrated);
        changes.put(live.clone());
        store.commit(changes).await.unwrap();
        let found = store.gateway("tok", "whatsapp").await.unwrap().unwrap();
        assert_eq!(found.id, live.id);
    }

    #[tokio::test]
    async fn two_integrated_gateways_conflict() {
        let store = InMemoryStore::new();
        let mut changes = ChangeSet::new();
        changes.put(gateway(GatewayState::Integrated));
        changes.put(gateway(GatewayState::Integrated));
        assert!(matches!(
            store.commit(changes).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn thread_messages_are_newest_first() {
        let store = InMemoryStore::new();
        let mut changes = ChangeSet::new();
        changes.put(inbound("wamid.a"));
        changes.put(inbound("wamid.b"));
        store.commit(changes).await.unwrap();
        let thread = ThreadRef::channel("c1");
        let messages = store.thread_messages(&thread).await.unwrap();
        assert_eq!(
            messages[0].provider_message_id.as_deref(),
            Some("wamid.b")
        );
        let parent = store.message_by_provider_ref(&thread, "WAMID.A").await.unwrap();
        assert_eq!(parent.unwrap().provider_message_id.as_deref(), Some("wamid.a"));
    }

    #[tokio::test]
    async fn provider_ref_prefers_exact_match_within_the_thread() {
        let store = InMemoryStore::new();
        let mut changes = ChangeSet::new();
        changes.put(inbound("wamid.A"));
        changes.put(inbound("wamid.AB"));
        let mut elsewhere = inbound("wamid.A1");
        elsewhere.thread = ThreadRef::channel("c2");
        changes.put(elsewhere);
        store.commit(changes).await.unwrap();

        let thread = ThreadRef::channel("c1");
        let exact = store.message_by_provider_ref(&thread, "wamid.a").await.unwrap();
        assert_eq!(exact.unwrap().provider_message_id.as_deref(), Some("wamid.A"));
        let other = ThreadRef::channel("c2");
        let found = store.message_by_provider_ref(&other, "wamid.AB").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn failed_commit_restores_replaced_rows() {
        let store = InMemoryStore::new();
        let mut seed = ChangeSet::new();
        let lead = Lead {
            id: "l1".into(),
            name: "Booking".into(),
            mobile: "34600000001".into(),
            status: LeadStatus::Draft,
            button_consumed: false,
        };
        seed.put(lead.clone());
        seed.put(inbound("wamid.1"));
        store.commit(seed).await.unwrap();

        let mut batch = ChangeSet::new();
        batch.put(Lead {
            status: LeadStatus::InProgress,
            ..lead
        });
        batch.put(inbound("wamid.2"));
        batch.put(inbound("wamid.1"));
        assert!(store.commit(batch).await.is_err());

        let leads = store.leads_for_mobile("34600000001").await.unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].status, LeadStatus::Draft);
        assert!(!store.message_exists("wamid.2").await.unwrap());

        let mut later = ChangeSet::new();
        later.put(inbound("wamid.3"));
        store.commit(later).await.unwrap();
        let thread = ThreadRef::channel("c1");
        let messages = store.thread_messages(&thread).await.unwrap();
        let order: Vec<_> = messages
            .iter()
            .filter_map(|m| m.provider_message_id.as_deref())
            .collect();
        assert_eq!(order, vec!["wamid.3", "wamid.1"]);
    }
}

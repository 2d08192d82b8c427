//! Cross-posting of conversation messages onto foreign business records.

use gwb_core::store::{ChangeSet, RecordStore, Result, StoreError};
use gwb_core::{Message, RecordRef, ThreadRef, new_id};
use tracing::{debug, info};

/// Copy of `source` posted on `record`; the copy carries no provider id.
fn copy_onto(source: &Message, record: RecordRef, parent_id: Option<String>) -> Message {
    Message {
        id: new_id(),
        thread: ThreadRef::Record(record),
        direction: source.direction,
        body: source.body.clone(),
        attachments: source.attachments.clone(),
        provider_message_id: None,
        parent_id,
        author: source.author.clone(),
        date: source.date,
        from_webhook: source.from_webhook,
        mirror_id: None,
        delivery: None,
    }
}

/// Fans a reply out to the record its parent was mirrored to.
///
/// Sets `reply.mirror_id` and stages the copy; does nothing when the parent was
/// never linked to a record.
pub async fn mirror_reply(
    store: &dyn RecordStore,
    changes: &mut ChangeSet,
    parent: &Message,
    reply: &mut Message,
) -> Result<Option<String>> {
    let Some(mirror_id) = parent.mirror_id.as_deref() else {
        return Ok(None);
    };
    let target = match changes.message(mirror_id).cloned() {
        Some(target) => Some(target),
        None => store.message(mirror_id).await?,
    };
    let Some(target) = target else {
        debug!(mirror_id, "mirror target vanished");
        return Ok(None);
    };
    let ThreadRef::Record(record) = target.thread.clone() else {
        return Ok(None);
    };
    info!(model = %record.model, res_id = %record.res_id, "mirroring reply onto linked record");
    let copy = copy_onto(reply, record, Some(target.id));
    reply.mirror_id = Some(copy.id.clone());
    let id = copy.id.clone();
    changes.put(copy);
    Ok(Some(id))
}

/// Copies a conversation message onto `target` and remembers the link on the source,
/// so later replies to it are mirrored too.
pub async fn link_message(
    store: &dyn RecordStore,
    message_id: &str,
    target: RecordRef,
) -> Result<Message> {
    let mut source = store
        .message(message_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
    let copy = copy_onto(&source, target, None);
    source.mirror_id = Some(copy.id.clone());
    let mut changes = ChangeSet::new();
    changes.put(copy.clone());
    changes.put(source);
    store.commit(changes).await?;
    info!(message = message_id, copy = %copy.id, "message linked to record");
    Ok(copy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwb_core::InMemoryStore;
    use time::OffsetDateTime;

    fn record() -> RecordRef {
        RecordRef {
            model: "crm.lead".into(),
            res_id: "42".into(),
        }
    }

    async fn seeded() -> (InMemoryStore, Message) {
        let store = InMemoryStore::new();
        let mut message = Message::outbound("c1", "Your booking", OffsetDateTime::UNIX_EPOCH);
        message.provider_message_id = Some("wamid.out.1".into());
        let mut seed = ChangeSet::new();
        seed.put(message.clone());
        store.commit(seed).await.unwrap();
        (store, message)
    }

    #[tokio::test]
    async fn link_copies_and_remembers_mirror() {
        let (store, message) = seeded().await;
        let copy = link_message(&store, &message.id, record()).await.unwrap();
        assert_eq!(copy.thread, ThreadRef::Record(record()));
        assert_eq!(copy.body, "Your booking");
        assert!(copy.provider_message_id.is_none());
        let source = store.message(&message.id).await.unwrap().unwrap();
        assert_eq!(source.mirror_id, Some(copy.id));
    }

    #[tokio::test]
    async fn link_unknown_message_is_not_found() {
        let store = InMemoryStore::new();
        let err = link_message(&store, "nope", record()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn reply_to_linked_parent_is_mirrored() {
        let (store, message) = seeded().await;
        link_message(&store, &message.id, record()).await.unwrap();
        let parent = store.message(&message.id).await.unwrap().unwrap();

        let mut reply = Message::outbound("c1", "See you there", OffsetDateTime::UNIX_EPOCH);
        reply.parent_id = Some(parent.id.clone());
        let mut changes = ChangeSet::new();
        let copy_id = mirror_reply(&store, &mut changes, &parent, &mut reply)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.mirror_id.as_deref(), Some(copy_id.as_str()));
        let copy = changes.message(&copy_id).unwrap();
        assert_eq!(copy.thread, ThreadRef::Record(record()));
        assert_eq!(copy.parent_id, parent.mirror_id);
    }

    #[tokio::test]
    async fn reply_to_unlinked_parent_stays_local() {
        let (store, parent) = seeded().await;
        let mut reply = Message::outbound("c1", "ok", OffsetDateTime::UNIX_EPOCH);
        let mut changes = ChangeSet::new();
        let copied = mirror_reply(&store, &mut changes, &parent, &mut reply)
            .await
            .unwrap();
        assert!(copied.is_none());
        assert!(changes.is_empty());
    }
}

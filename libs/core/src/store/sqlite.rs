use std::{
    path::Path,
    sync::{Arc, Mutex as StdMutex},
};

use rusqlite::{Connection, ErrorCode, OptionalExtension, Params, Transaction, params};
use serde::de::DeserializeOwned;
use tokio::task::spawn_blocking;

use super::{ChangeSet, Record, RecordStore, Result, StoreError};
use crate::text::sanitize_phone;
use crate::types::{
    ButtonBinding, Channel, Contact, DeliveryAttempt, Gateway, Guest, IdentityLink, Lead, Message,
    QueueEntry, Template, TemplateSend, ThreadRef,
};

const CREATE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS gateways (
    id TEXT PRIMARY KEY,
    token TEXT NOT NULL,
    gateway_type TEXT NOT NULL,
    state TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS gateways_integrated
    ON gateways (token, gateway_type) WHERE state = 'integrated';
CREATE TABLE IF NOT EXISTS channels (
    id TEXT PRIMARY KEY,
    gateway_id TEXT NOT NULL,
    token TEXT NOT NULL,
    data TEXT NOT NULL,
    UNIQUE (gateway_id, token)
);
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    thread_key TEXT NOT NULL,
    provider_message_id TEXT UNIQUE,
    pending INTEGER NOT NULL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_thread ON messages (thread_key);
CREATE TABLE IF NOT EXISTS contacts (
    id TEXT PRIMARY KEY,
    phone_sanitized TEXT,
    mobile_sanitized TEXT,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS guests (
    id TEXT PRIMARY KEY,
    gateway_id TEXT NOT NULL,
    token TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS identity_links (
    id TEXT PRIMARY KEY,
    gateway_id TEXT NOT NULL,
    token TEXT NOT NULL,
    data TEXT NOT NULL,
    UNIQUE (gateway_id, token)
);
CREATE TABLE IF NOT EXISTS leads (
    id TEXT PRIMARY KEY,
    mobile_sanitized TEXT,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS queue_entries (
    id TEXT PRIMARY KEY,
    channel_id TEXT NOT NULL,
    active INTEGER NOT NULL,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS templates (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS template_sends (
    id TEXT PRIMARY KEY,
    template_id TEXT NOT NULL,
    provider_message_id TEXT,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS button_bindings (
    id TEXT PRIMARY KEY,
    template_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    data TEXT NOT NULL,
    UNIQUE (template_id, payload)
);
CREATE TABLE IF NOT EXISTS delivery_attempts (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    data TEXT NOT NULL
);
"#;

/// SQLite-backed store. Records are kept as JSON next to the columns used for lookups.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<StdMutex<Connection>>,
}

fn internal(err: rusqlite::Error) -> StoreError {
    StoreError::Internal(err.into())
}

fn is_constraint(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation)
}

fn fetch_one<T: DeserializeOwned, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Option<T>> {
    let raw: Option<String> = conn
        .query_row(sql, params, |row| row.get(0))
        .optional()
        .map_err(internal)?;
    Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
}

fn fetch_all<T: DeserializeOwned, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql).map_err(internal)?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(internal)?;
    let mut out = Vec::new();
    for raw in rows {
        let raw = raw.map_err(internal)?;
        out.push(serde_json::from_str(&raw)?);
    }
    Ok(out)
}

fn put_record(tx: &Transaction<'_>, record: &Record) -> Result<()> {
    let outcome = match record {
        Record::Gateway(r) => tx.execute(
            "INSERT INTO gateways (id, token, gateway_type, state, data) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET token=excluded.token, gateway_type=excluded.gateway_type,
             state=excluded.state, data=excluded.data",
            params![
                r.id,
                r.token,
                r.gateway_type,
                r.state.as_str(),
                serde_json::to_string(r)?
            ],
        ),
        Record::Channel(r) => tx.execute(
            "INSERT INTO channels (id, gateway_id, token, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET gateway_id=excluded.gateway_id, token=excluded.token,
             data=excluded.data",
            params![
                r.id,
                r.gateway_id,
                r.gateway_channel_token,
                serde_json::to_string(r)?
            ],
        ),
        Record::Message(r) => tx.execute(
            "INSERT INTO messages (id, thread_key, provider_message_id, pending, data)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET thread_key=excluded.thread_key,
             provider_message_id=excluded.provider_message_id, pending=excluded.pending,
             data=excluded.data",
            params![
                r.id,
                r.thread.key(),
                r.provider_message_id,
                is_pending(r),
                serde_json::to_string(r)?
            ],
        ),
        Record::Contact(r) => tx.execute(
            "INSERT INTO contacts (id, phone_sanitized, mobile_sanitized, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET phone_sanitized=excluded.phone_sanitized,
             mobile_sanitized=excluded.mobile_sanitized, data=excluded.data",
            params![
                r.id,
                r.phone.as_deref().and_then(sanitize_phone),
                r.mobile.as_deref().and_then(sanitize_phone),
                serde_json::to_string(r)?
            ],
        ),
        Record::Guest(r) => tx.execute(
            "INSERT INTO guests (id, gateway_id, token, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET gateway_id=excluded.gateway_id, token=excluded.token,
             data=excluded.data",
            params![r.id, r.gateway_id, r.gateway_token, serde_json::to_string(r)?],
        ),
        Record::IdentityLink(r) => tx.execute(
            "INSERT INTO identity_links (id, gateway_id, token, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET gateway_id=excluded.gateway_id, token=excluded.token,
             data=excluded.data",
            params![r.id, r.gateway_id, r.gateway_token, serde_json::to_string(r)?],
        ),
        Record::Lead(r) => tx.execute(
            "INSERT INTO leads (id, mobile_sanitized, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET mobile_sanitized=excluded.mobile_sanitized,
             data=excluded.data",
            params![r.id, sanitize_phone(&r.mobile), serde_json::to_string(r)?],
        ),
        Record::QueueEntry(r) => tx.execute(
            "INSERT INTO queue_entries (id, channel_id, active, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET channel_id=excluded.channel_id, active=excluded.active,
             data=excluded.data",
            params![r.id, r.channel_id, r.is_active(), serde_json::to_string(r)?],
        ),
        Record::Template(r) => tx.execute(
            "INSERT INTO templates (id, name, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name=excluded.name, data=excluded.data",
            params![r.id, r.name, serde_json::to_string(r)?],
        ),
        Record::TemplateSend(r) => tx.execute(
            "INSERT INTO template_sends (id, template_id, provider_message_id, data)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET template_id=excluded.template_id,
             provider_message_id=excluded.provider_message_id, data=excluded.data",
            params![
                r.id,
                r.template_id,
                r.provider_message_id,
                serde_json::to_string(r)?
            ],
        ),
        Record::ButtonBinding(r) => tx.execute(
            "INSERT INTO button_bindings (id, template_id, payload, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET template_id=excluded.template_id,
             payload=excluded.payload, data=excluded.data",
            params![r.id, r.template_id, r.payload, serde_json::to_string(r)?],
        ),
        Record::DeliveryAttempt(r) => tx.execute(
            "INSERT INTO delivery_attempts (id, message_id, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET message_id=excluded.message_id, data=excluded.data",
            params![r.id, r.message_id, serde_json::to_string(r)?],
        ),
    };
    match outcome {
        Ok(_) => Ok(()),
        Err(err) if is_constraint(&err) => Err(match record {
            Record::Message(message) => StoreError::DuplicateMessage(
                message.provider_message_id.clone().unwrap_or_default(),
            ),
            other => StoreError::Conflict(other.id().to_string()),
        }),
        Err(err) => Err(internal(err)),
    }
}

fn is_pending(message: &Message) -> bool {
    message.direction == crate::types::Direction::Outbound
        && message.delivery_status() == Some(crate::types::NotificationStatus::Ready)
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES_SQL)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, func: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Internal(anyhow::anyhow!("sqlite connection poisoned")))?;
            func(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Internal(err.into()))?
    }

    async fn one<T>(&self, sql: &'static str, args: Vec<String>) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.with_conn(move |conn| fetch_one(conn, sql, rusqlite::params_from_iter(args)))
            .await
    }

    async fn all<T>(&self, sql: &'static str, args: Vec<String>) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.with_conn(move |conn| fetch_all(conn, sql, rusqlite::params_from_iter(args)))
            .await
    }
}

#[async_trait::async_trait]
impl RecordStore for SqliteStore {
    async fn gateway(&self, token: &str, gateway_type: &str) -> Result<Option<Gateway>> {
        self.one(
            "SELECT data FROM gateways WHERE token = ?1 AND gateway_type = ?2
             ORDER BY state = 'integrated' DESC, rowid DESC LIMIT 1",
            vec![token.to_string(), gateway_type.to_string()],
        )
        .await
    }

    async fn gateway_by_id(&self, id: &str) -> Result<Option<Gateway>> {
        self.one("SELECT data FROM gateways WHERE id = ?1", vec![id.to_string()])
            .await
    }

    async fn gateways(&self) -> Result<Vec<Gateway>> {
        self.all("SELECT data FROM gateways ORDER BY rowid", Vec::new())
            .await
    }

    async fn channel(&self, gateway_id: &str, token: &str) -> Result<Option<Channel>> {
        self.one(
            "SELECT data FROM channels WHERE gateway_id = ?1 AND token = ?2",
            vec![gateway_id.to_string(), token.to_string()],
        )
        .await
    }

    async fn channel_by_id(&self, id: &str) -> Result<Option<Channel>> {
        self.one("SELECT data FROM channels WHERE id = ?1", vec![id.to_string()])
            .await
    }

    async fn message(&self, id: &str) -> Result<Option<Message>> {
        self.one("SELECT data FROM messages WHERE id = ?1", vec![id.to_string()])
            .await
    }

    async fn message_exists(&self, provider_message_id: &str) -> Result<bool> {
        let provider_message_id = provider_message_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE provider_message_id = ?1)",
                params![provider_message_id],
                |row| row.get::<_, bool>(0),
            )
            .map_err(internal)
        })
        .await
    }

    async fn message_by_provider_ref(
        &self,
        thread: &ThreadRef,
        reference: &str,
    ) -> Result<Option<Message>> {
        if reference.is_empty() {
            return Ok(None);
        }
        self.one(
            "SELECT data FROM messages
             WHERE thread_key = ?2 AND provider_message_id IS NOT NULL
               AND lower(substr(provider_message_id, 1, length(?1))) = lower(?1)
             ORDER BY lower(provider_message_id) = lower(?1) DESC, rowid DESC LIMIT 1",
            vec![reference.to_string(), thread.key()],
        )
        .await
    }

    async fn thread_messages(&self, thread: &ThreadRef) -> Result<Vec<Message>> {
        self.all(
            "SELECT data FROM messages WHERE thread_key = ?1 ORDER BY rowid DESC",
            vec![thread.key()],
        )
        .await
    }

    async fn pending_deliveries(&self, limit: usize) -> Result<Vec<Message>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            fetch_all(
                conn,
                "SELECT data FROM messages WHERE pending = 1 ORDER BY rowid LIMIT ?1",
                params![limit],
            )
        })
        .await
    }

    async fn identity_link(&self, gateway_id: &str, token: &str) -> Result<Option<IdentityLink>> {
        self.one(
            "SELECT data FROM identity_links WHERE gateway_id = ?1 AND token = ?2",
            vec![gateway_id.to_string(), token.to_string()],
        )
        .await
    }

    async fn contact(&self, id: &str) -> Result<Option<Contact>> {
        self.one("SELECT data FROM contacts WHERE id = ?1", vec![id.to_string()])
            .await
    }

    async fn contact_by_phone(&self, sanitized: &str) -> Result<Option<Contact>> {
        self.one(
            "SELECT data FROM contacts WHERE phone_sanitized = ?1 OR mobile_sanitized = ?1
             ORDER BY rowid LIMIT 1",
            vec![sanitized.to_string()],
        )
        .await
    }

    async fn guest(&self, id: &str) -> Result<Option<Guest>> {
        self.one("SELECT data FROM guests WHERE id = ?1", vec![id.to_string()])
            .await
    }

    async fn guest_by_token(&self, gateway_id: &str, token: &str) -> Result<Option<Guest>> {
        self.one(
            "SELECT data FROM guests WHERE gateway_id = ?1 AND token = ?2 ORDER BY rowid LIMIT 1",
            vec![gateway_id.to_string(), token.to_string()],
        )
        .await
    }

    async fn leads_for_mobile(&self, sanitized: &str) -> Result<Vec<Lead>> {
        self.all(
            "SELECT data FROM leads WHERE mobile_sanitized = ?1 ORDER BY rowid DESC",
            vec![sanitized.to_string()],
        )
        .await
    }

    async fn active_queue_entry(&self, channel_id: &str) -> Result<Option<QueueEntry>> {
        self.one(
            "SELECT data FROM queue_entries WHERE channel_id = ?1 AND active = 1
             ORDER BY rowid DESC LIMIT 1",
            vec![channel_id.to_string()],
        )
        .await
    }

    async fn template(&self, name: &str) -> Result<Option<Template>> {
        self.one("SELECT data FROM templates WHERE name = ?1", vec![name.to_string()])
            .await
    }

    async fn template_for_provider_message(&self, reference: &str) -> Result<Option<Template>> {
        if reference.is_empty() {
            return Ok(None);
        }
        self.one(
            "SELECT t.data FROM template_sends s JOIN templates t ON t.id = s.template_id
             WHERE s.provider_message_id IS NOT NULL
               AND lower(substr(s.provider_message_id, 1, length(?1))) = lower(?1)
             ORDER BY s.rowid DESC LIMIT 1",
            vec![reference.to_string()],
        )
        .await
    }

    async fn button_binding(
        &self,
        template_id: &str,
        payload: &str,
    ) -> Result<Option<ButtonBinding>> {
        self.one(
            "SELECT data FROM button_bindings WHERE template_id = ?1 AND payload = ?2",
            vec![template_id.to_string(), payload.to_string()],
        )
        .await
    }

    async fn button_bindings(&self) -> Result<Vec<ButtonBinding>> {
        self.all("SELECT data FROM button_bindings ORDER BY rowid", Vec::new())
            .await
    }

    async fn delivery_attempts(&self, message_id: &str) -> Result<Vec<DeliveryAttempt>> {
        self.all(
            "SELECT data FROM delivery_attempts WHERE message_id = ?1 ORDER BY rowid",
            vec![message_id.to_string()],
        )
        .await
    }

    async fn commit(&self, changes: ChangeSet) -> Result<()> {
        let records = changes.into_records();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(internal)?;
            for record in &records {
                put_record(&tx, record)?;
            }
            tx.commit().map_err(internal)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, GatewayState, ProviderCredentials, new_id};
    use tempfile::tempdir;
    use time::OffsetDateTime;

    fn inbound(provider_id: &str) -> Message {
        let mut message = Message::outbound("c1", "hola", OffsetDateTime::UNIX_EPOCH);
        message.direction = Direction::Inbound;
        message.delivery = None;
        message.provider_message_id = Some(provider_id.into());
        message
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            let mut changes = ChangeSet::new();
            changes.put(Gateway {
                id: new_id(),
                name: "wa".into(),
                token: "tok".into(),
                gateway_type: "whatsapp".into(),
                state: GatewayState::Integrated,
                webhook_secret: "s".into(),
                verify_token: "v".into(),
                credentials: ProviderCredentials {
                    bearer_token: "b".into(),
                    api_version: "20.0".into(),
                    from_phone: "1".into(),
                },
            });
            changes.put(inbound("wamid.1"));
            store.commit(changes).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.message_exists("wamid.1").await.unwrap());
        let gateway = store.gateway("tok", "whatsapp").await.unwrap().unwrap();
        assert!(gateway.is_integrated());
    }

    #[tokio::test]
    async fn duplicate_provider_id_rolls_back_batch() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("gateway.db")).unwrap();
        let mut first = ChangeSet::new();
        first.put(inbound("wamid.1"));
        store.commit(first).await.unwrap();

        let mut second = ChangeSet::new();
        second.put(inbound("wamid.2"));
        second.put(inbound("wamid.1"));
        let err = store.commit(second).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateMessage(id) if id == "wamid.1"));
        assert!(!store.message_exists("wamid.2").await.unwrap());
    }

    #[tokio::test]
    async fn pending_deliveries_only_lists_ready_outbound() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("gateway.db")).unwrap();
        let mut changes = ChangeSet::new();
        let outbound = Message::outbound("c1", "reply", OffsetDateTime::UNIX_EPOCH);
        changes.put(outbound.clone());
        changes.put(inbound("wamid.9"));
        store.commit(changes).await.unwrap();
        let pending = store.pending_deliveries(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, outbound.id);
    }

    #[tokio::test]
    async fn provider_ref_lookup_stays_in_its_thread() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("gateway.db")).unwrap();
        let mut changes = ChangeSet::new();
        changes.put(inbound("wamid.9"));
        let mut other = inbound("wamid.90");
        other.thread = ThreadRef::channel("c2");
        changes.put(other.clone());
        store.commit(changes).await.unwrap();

        let own = ThreadRef::channel("c1");
        let found = store.message_by_provider_ref(&own, "WAMID.9").await.unwrap();
        assert_eq!(found.unwrap().provider_message_id.as_deref(), Some("wamid.9"));

        let foreign = ThreadRef::channel("c2");
        let found = store.message_by_provider_ref(&foreign, "wamid.9").await.unwrap();
        assert_eq!(found.unwrap().id, other.id);
        let missing = ThreadRef::channel("c3");
        assert!(store.message_by_provider_ref(&missing, "wamid.9").await.unwrap().is_none());
    }
}

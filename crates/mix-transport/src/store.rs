//! Durable, crash-consistent egress/ingress storage.
//!
//! Two implementations share the [`EgressStore`] trait: [`SqliteEgressStore`]
//! (WAL-mode SQLite, schema versioned via `PRAGMA user_version`) for
//! production use, and [`InMemoryEgressStore`] for tests and callers that
//! accept losing outstanding sends across a crash. Both satisfy the same
//! invariants; only the SQLite one is durable.

use crate::{NodeId, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::Mutex;

/// Identifier of a single-use reply block, keying one outstanding
/// (unacknowledged) send.
pub type SurbId = [u8; 16];

/// The recipient-side routing context needed to build a fresh route (and
/// thus a fresh SURB) each time a block is sent or retransmitted. Kept on
/// the record itself, rather than threaded through every ARQ call, because
/// a retransmit years — well, seconds — after the original send must still
/// know where the packet is going.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RouteContext {
    /// Our own provider's node identifier.
    pub sender_provider: NodeId,
    /// Our own provider's stratified layer.
    pub sender_provider_layer: u8,
    /// Recipient's provider's node identifier.
    pub recipient_provider: NodeId,
    /// Recipient's provider's stratified layer.
    pub recipient_provider_layer: u8,
    /// Recipient's mailbox identifier at their provider.
    pub recipient_mailbox_id: [u8; 32],
    /// Our own mailbox identifier at our provider (the reply path's
    /// destination).
    pub sender_mailbox_id: [u8; 32],
}

/// One outstanding send awaiting acknowledgment, as tracked by the ARQ
/// scheduler and persisted so it survives a crash.
///
/// Each retransmit replaces this record under a freshly-generated
/// `surb_id` (a new route and a new SURB are built for every send, per
/// §4.D) — `sealed_block` is kept because it alone is route-independent
/// and can be resealed into a new Sphinx packet without re-running Noise_X.
#[derive(Debug, Clone)]
pub struct EgressRecord {
    /// The SURB identifier this record is keyed by.
    pub surb_id: SurbId,
    /// Identifier of the message this block belongs to.
    pub message_id: [u8; 16],
    /// This block's index within its message.
    pub block_index: u16,
    /// The Noise_X-sealed block ciphertext (route-independent), resealed
    /// into a fresh Sphinx packet on every send and retransmit.
    pub sealed_block: Vec<u8>,
    /// Routing context needed to rebuild a route for this block on
    /// retransmit.
    pub route_context: RouteContext,
    /// Key material needed to decrypt the ACK/reply sent along this
    /// record's current SURB (bincode-encoded `sphinx::SurbKeys`).
    pub surb_keys: Vec<u8>,
    /// Unix milliseconds this record was first sent.
    pub sent_at_ms: u64,
    /// Unix milliseconds at which the ARQ timer should retransmit absent
    /// an ACK.
    pub deadline_ms: u64,
    /// Number of times this block has been retransmitted.
    pub retransmit_count: u32,
}

/// One fragment of an in-progress incoming message, awaiting its siblings.
#[derive(Debug, Clone)]
pub struct IngressRecord {
    /// Shared identifier of the message this fragment belongs to.
    pub message_id: [u8; 16],
    /// The sender's long-term static public key, recovered from opening
    /// this fragment's Noise_X seal. Part of the sibling-consistency
    /// check: fragments claiming the same `message_id` but opened under
    /// different sender keys belong to different messages.
    pub sender_key: [u8; 32],
    /// This fragment's index.
    pub index: u16,
    /// Total fragment count the sender declared for this message.
    pub total: u16,
    /// This fragment's payload bytes.
    pub payload: Vec<u8>,
    /// Unix milliseconds this fragment was received.
    pub received_at_ms: u64,
}

/// Durable egress and ingress state for one identity.
pub trait EgressStore: Send + Sync {
    /// Insert a new outstanding send record.
    fn put(&self, record: EgressRecord) -> Result<()>;

    /// Update an outstanding record's retransmit deadline and increment its
    /// retransmit count, after the ARQ timer fires and resends it.
    fn update_deadline(&self, surb_id: &SurbId, new_deadline_ms: u64) -> Result<()>;

    /// Fetch one outstanding record by its SURB identifier.
    fn get(&self, surb_id: &SurbId) -> Result<Option<EgressRecord>>;

    /// Fetch just the SURB key material for a record, for ACK decryption
    /// without loading the full (potentially large) sealed packet.
    fn get_surb_keys(&self, surb_id: &SurbId) -> Result<Option<Vec<u8>>>;

    /// Remove an outstanding record once it has been acknowledged or
    /// abandoned.
    fn remove(&self, surb_id: &SurbId) -> Result<()>;

    /// Insert one incoming fragment.
    fn put_ingress(&self, record: IngressRecord) -> Result<()>;

    /// Fetch every fragment received so far for a given message.
    fn get_ingress_group(&self, message_id: &[u8; 16]) -> Result<Vec<IngressRecord>>;

    /// Remove every fragment for a given message (after successful
    /// reassembly, or on abandonment).
    fn remove_ingress(&self, message_id: &[u8; 16]) -> Result<()>;

    /// Record a fully reassembled message for delivery to the application.
    fn put_assembled(&self, message_id: [u8; 16], payload: Vec<u8>) -> Result<()>;

    /// List every assembled message awaiting delivery.
    fn list_assembled(&self) -> Result<Vec<([u8; 16], Vec<u8>)>>;

    /// Remove an assembled message once the application has consumed it.
    fn delete_assembled(&self, message_id: &[u8; 16]) -> Result<()>;
}

/// Current schema version.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE egress (
    surb_id BLOB PRIMARY KEY,
    message_id BLOB NOT NULL,
    block_index INTEGER NOT NULL,
    sealed_block BLOB NOT NULL,
    route_context BLOB NOT NULL,
    surb_keys BLOB NOT NULL,
    sent_at_ms INTEGER NOT NULL,
    deadline_ms INTEGER NOT NULL,
    retransmit_count INTEGER NOT NULL
);

CREATE TABLE ingress (
    message_id BLOB NOT NULL,
    sender_key BLOB NOT NULL,
    idx INTEGER NOT NULL,
    total INTEGER NOT NULL,
    payload BLOB NOT NULL,
    received_at_ms INTEGER NOT NULL,
    PRIMARY KEY (message_id, idx)
);

CREATE TABLE assembled (
    message_id BLOB PRIMARY KEY,
    payload BLOB NOT NULL
);
";

/// A SQLite-backed [`EgressStore`]: WAL journaling, foreign keys enabled,
/// schema versioned via `PRAGMA user_version`.
pub struct SqliteEgressStore {
    conn: Mutex<Connection>,
}

impl SqliteEgressStore {
    /// Open (creating if absent) a durable store at `path`.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        Self::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open a transient SQLite store backed by an in-memory database. Not
    /// durable across process restarts, but otherwise identical behavior
    /// to the file-backed store — useful when tests want to exercise the
    /// real SQL paths without touching disk.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Self::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        Ok(())
    }

    fn migrate(conn: &Connection) -> Result<()> {
        let current: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if current == 0 {
            conn.execute_batch(SCHEMA_V1)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        Ok(())
    }
}

impl EgressStore for SqliteEgressStore {
    fn put(&self, record: EgressRecord) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex not poisoned");
        let route_context = bincode::serialize(&record.route_context)
            .map_err(|e| crate::TransportError::Fatal(format!("encoding route context: {e}")))?;
        conn.execute(
            "INSERT INTO egress
                (surb_id, message_id, block_index, sealed_block, route_context, surb_keys, sent_at_ms, deadline_ms, retransmit_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.surb_id.as_slice(),
                record.message_id.as_slice(),
                record.block_index,
                record.sealed_block,
                route_context,
                record.surb_keys,
                record.sent_at_ms,
                record.deadline_ms,
                record.retransmit_count,
            ],
        )?;
        Ok(())
    }

    fn update_deadline(&self, surb_id: &SurbId, new_deadline_ms: u64) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex not poisoned");
        conn.execute(
            "UPDATE egress SET deadline_ms = ?1, retransmit_count = retransmit_count + 1 WHERE surb_id = ?2",
            params![new_deadline_ms, surb_id.as_slice()],
        )?;
        Ok(())
    }

    fn get(&self, surb_id: &SurbId) -> Result<Option<EgressRecord>> {
        let conn = self.conn.lock().expect("store mutex not poisoned");
        let raw = conn
            .query_row(
                "SELECT surb_id, message_id, block_index, sealed_block, route_context, surb_keys, sent_at_ms, deadline_ms, retransmit_count
                 FROM egress WHERE surb_id = ?1",
                params![surb_id.as_slice()],
                |row| {
                    let surb_id: Vec<u8> = row.get(0)?;
                    let message_id: Vec<u8> = row.get(1)?;
                    let route_context_bytes: Vec<u8> = row.get(4)?;
                    Ok((
                        surb_id,
                        message_id,
                        row.get::<_, u16>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        route_context_bytes,
                        row.get::<_, Vec<u8>>(5)?,
                        row.get::<_, u64>(6)?,
                        row.get::<_, u64>(7)?,
                        row.get::<_, u32>(8)?,
                    ))
                },
            )
            .optional()?;
        let Some((surb_id, message_id, block_index, sealed_block, route_context_bytes, surb_keys, sent_at_ms, deadline_ms, retransmit_count)) = raw else {
            return Ok(None);
        };
        let route_context: RouteContext = bincode::deserialize(&route_context_bytes)
            .map_err(|e| crate::TransportError::Fatal(format!("decoding route context: {e}")))?;
        Ok(Some(EgressRecord {
            surb_id: surb_id.try_into().unwrap_or([0u8; 16]),
            message_id: message_id.try_into().unwrap_or([0u8; 16]),
            block_index,
            sealed_block,
            route_context,
            surb_keys,
            sent_at_ms,
            deadline_ms,
            retransmit_count,
        }))
    }

    fn get_surb_keys(&self, surb_id: &SurbId) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("store mutex not poisoned");
        let keys = conn
            .query_row(
                "SELECT surb_keys FROM egress WHERE surb_id = ?1",
                params![surb_id.as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(keys)
    }

    fn remove(&self, surb_id: &SurbId) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex not poisoned");
        conn.execute("DELETE FROM egress WHERE surb_id = ?1", params![surb_id.as_slice()])?;
        Ok(())
    }

    fn put_ingress(&self, record: IngressRecord) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex not poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO ingress (message_id, sender_key, idx, total, payload, received_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.message_id.as_slice(),
                record.sender_key.as_slice(),
                record.index,
                record.total,
                record.payload,
                record.received_at_ms,
            ],
        )?;
        Ok(())
    }

    fn get_ingress_group(&self, message_id: &[u8; 16]) -> Result<Vec<IngressRecord>> {
        let conn = self.conn.lock().expect("store mutex not poisoned");
        let mut stmt = conn.prepare(
            "SELECT message_id, sender_key, idx, total, payload, received_at_ms FROM ingress WHERE message_id = ?1 ORDER BY idx",
        )?;
        let rows = stmt.query_map(params![message_id.as_slice()], |row| {
            let message_id: Vec<u8> = row.get(0)?;
            let sender_key: Vec<u8> = row.get(1)?;
            Ok(IngressRecord {
                message_id: message_id.try_into().unwrap_or([0u8; 16]),
                sender_key: sender_key.try_into().unwrap_or([0u8; 32]),
                index: row.get(2)?,
                total: row.get(3)?,
                payload: row.get(4)?,
                received_at_ms: row.get(5)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn remove_ingress(&self, message_id: &[u8; 16]) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex not poisoned");
        conn.execute("DELETE FROM ingress WHERE message_id = ?1", params![message_id.as_slice()])?;
        Ok(())
    }

    fn put_assembled(&self, message_id: [u8; 16], payload: Vec<u8>) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex not poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO assembled (message_id, payload) VALUES (?1, ?2)",
            params![message_id.as_slice(), payload],
        )?;
        Ok(())
    }

    fn list_assembled(&self) -> Result<Vec<([u8; 16], Vec<u8>)>> {
        let conn = self.conn.lock().expect("store mutex not poisoned");
        let mut stmt = conn.prepare("SELECT message_id, payload FROM assembled")?;
        let rows = stmt.query_map([], |row| {
            let message_id: Vec<u8> = row.get(0)?;
            let payload: Vec<u8> = row.get(1)?;
            Ok((message_id.try_into().unwrap_or([0u8; 16]), payload))
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn delete_assembled(&self, message_id: &[u8; 16]) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex not poisoned");
        conn.execute("DELETE FROM assembled WHERE message_id = ?1", params![message_id.as_slice()])?;
        Ok(())
    }
}

/// An in-memory [`EgressStore`] for tests and non-durable callers.
#[derive(Default)]
pub struct InMemoryEgressStore {
    inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    egress: HashMap<SurbId, EgressRecord>,
    ingress: HashMap<[u8; 16], Vec<IngressRecord>>,
    assembled: HashMap<[u8; 16], Vec<u8>>,
}

impl InMemoryEgressStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl EgressStore for InMemoryEgressStore {
    fn put(&self, record: EgressRecord) -> Result<()> {
        self.inner
            .lock()
            .expect("store mutex not poisoned")
            .egress
            .insert(record.surb_id, record);
        Ok(())
    }

    fn update_deadline(&self, surb_id: &SurbId, new_deadline_ms: u64) -> Result<()> {
        if let Some(record) = self.inner.lock().expect("store mutex not poisoned").egress.get_mut(surb_id) {
            record.deadline_ms = new_deadline_ms;
            record.retransmit_count += 1;
        }
        Ok(())
    }

    fn get(&self, surb_id: &SurbId) -> Result<Option<EgressRecord>> {
        Ok(self
            .inner
            .lock()
            .expect("store mutex not poisoned")
            .egress
            .get(surb_id)
            .cloned())
    }

    fn get_surb_keys(&self, surb_id: &SurbId) -> Result<Option<Vec<u8>>> {
        Ok(self
            .inner
            .lock()
            .expect("store mutex not poisoned")
            .egress
            .get(surb_id)
            .map(|r| r.surb_keys.clone()))
    }

    fn remove(&self, surb_id: &SurbId) -> Result<()> {
        self.inner.lock().expect("store mutex not poisoned").egress.remove(surb_id);
        Ok(())
    }

    fn put_ingress(&self, record: IngressRecord) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex not poisoned");
        let group = inner.ingress.entry(record.message_id).or_default();
        group.retain(|r| r.index != record.index);
        group.push(record);
        group.sort_by_key(|r| r.index);
        Ok(())
    }

    fn get_ingress_group(&self, message_id: &[u8; 16]) -> Result<Vec<IngressRecord>> {
        Ok(self
            .inner
            .lock()
            .expect("store mutex not poisoned")
            .ingress
            .get(message_id)
            .cloned()
            .unwrap_or_default())
    }

    fn remove_ingress(&self, message_id: &[u8; 16]) -> Result<()> {
        self.inner.lock().expect("store mutex not poisoned").ingress.remove(message_id);
        Ok(())
    }

    fn put_assembled(&self, message_id: [u8; 16], payload: Vec<u8>) -> Result<()> {
        self.inner
            .lock()
            .expect("store mutex not poisoned")
            .assembled
            .insert(message_id, payload);
        Ok(())
    }

    fn list_assembled(&self) -> Result<Vec<([u8; 16], Vec<u8>)>> {
        Ok(self
            .inner
            .lock()
            .expect("store mutex not poisoned")
            .assembled
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect())
    }

    fn delete_assembled(&self, message_id: &[u8; 16]) -> Result<()> {
        self.inner.lock().expect("store mutex not poisoned").assembled.remove(message_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(surb_id: SurbId) -> EgressRecord {
        EgressRecord {
            surb_id,
            message_id: [1u8; 16],
            block_index: 0,
            sealed_block: vec![0u8; 10],
            route_context: RouteContext {
                sender_provider: NodeId::new([0xAA; 32]),
                sender_provider_layer: 0,
                recipient_provider: NodeId::new([0xBB; 32]),
                recipient_provider_layer: 0,
                recipient_mailbox_id: [0xCC; 32],
                sender_mailbox_id: [0xDD; 32],
            },
            surb_keys: vec![1, 2, 3],
            sent_at_ms: 1000,
            deadline_ms: 2000,
            retransmit_count: 0,
        }
    }

    fn exercise_store(store: &dyn EgressStore) {
        let surb_id = [9u8; 16];
        store.put(sample_record(surb_id)).expect("put");
        assert!(store.get(&surb_id).expect("get").is_some());

        store.update_deadline(&surb_id, 5000).expect("update_deadline");
        let record = store.get(&surb_id).expect("get").expect("present");
        assert_eq!(record.deadline_ms, 5000);
        assert_eq!(record.retransmit_count, 1);

        assert_eq!(store.get_surb_keys(&surb_id).expect("get_surb_keys"), Some(vec![1, 2, 3]));

        store.remove(&surb_id).expect("remove");
        assert!(store.get(&surb_id).expect("get").is_none());

        let message_id = [2u8; 16];
        let sender_key = [7u8; 32];
        store
            .put_ingress(IngressRecord {
                message_id,
                sender_key,
                index: 0,
                total: 2,
                payload: vec![0xAA],
                received_at_ms: 1,
            })
            .expect("put_ingress");
        store
            .put_ingress(IngressRecord {
                message_id,
                sender_key,
                index: 1,
                total: 2,
                payload: vec![0xBB],
                received_at_ms: 2,
            })
            .expect("put_ingress");
        let group = store.get_ingress_group(&message_id).expect("get_ingress_group");
        assert_eq!(group.len(), 2);
        assert_eq!(group[0].index, 0);
        assert_eq!(group[1].index, 1);

        store.remove_ingress(&message_id).expect("remove_ingress");
        assert!(store.get_ingress_group(&message_id).expect("get_ingress_group").is_empty());

        store.put_assembled(message_id, vec![1, 2, 3]).expect("put_assembled");
        assert_eq!(store.list_assembled().expect("list_assembled").len(), 1);
        store.delete_assembled(&message_id).expect("delete_assembled");
        assert!(store.list_assembled().expect("list_assembled").is_empty());
    }

    #[test]
    fn sqlite_store_round_trips() {
        let store = SqliteEgressStore::open_memory().expect("open in-memory sqlite store");
        exercise_store(&store);
    }

    #[test]
    fn in_memory_store_round_trips() {
        let store = InMemoryEgressStore::new();
        exercise_store(&store);
    }

    #[test]
    fn sqlite_store_enables_wal_and_foreign_keys() {
        let store = SqliteEgressStore::open_memory().expect("open");
        let conn = store.conn.lock().expect("mutex");
        let fk: i64 = conn.pragma_query_value(None, "foreign_keys", |row| row.get(0)).expect("fk");
        assert_eq!(fk, 1);
    }
}

//! Replicated state store.
//!
//! `ReplicatedStore` wraps a [`StateStore`] backend and turns every local
//! mutation into a [`ChangeRecord`] carrying the node's origin id, a
//! monotonic per-origin sequence, and the current epoch. Records are
//! published on a broadcast feed that the replication sender fans out to
//! peers.
//!
//! Remote records are applied through [`ReplicatedStore::apply_remote`],
//! which tracks a per-origin applied highwater so replayed records are
//! no-ops.
//!
//! While the node is degraded (serving without a reachable peer) local
//! changes are additionally appended to a divergence log; the reconciler
//! drains it when the partition heals.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::error::HaResult;
use super::metrics;
use crate::types::{ChangeRecord, Epoch, EntityKey, NodeId, Sequence};

/// Capacity of the outbound change feed.
const FEED_CAPACITY: usize = 1024;

/// Backing storage for replicated entities.
///
/// The engine ships with [`MemoryStateStore`]; embedders supply their own
/// implementation to persist entities or forward them into the packet
/// path.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current value of an entity.
    async fn get(&self, key: &EntityKey) -> HaResult<Option<Bytes>>;

    /// Write or delete an entity. Returns the previous value.
    async fn put(&self, key: EntityKey, value: Option<Bytes>) -> HaResult<Option<Bytes>>;

    /// All entities, optionally filtered by entity type.
    async fn scan(&self, entity_type: Option<&str>) -> HaResult<Vec<(EntityKey, Bytes)>>;

    /// Drop everything. Used when installing a snapshot.
    async fn clear(&self) -> HaResult<()>;
}

/// In-memory backend over a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: DashMap<EntityKey, Bytes>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &EntityKey) -> HaResult<Option<Bytes>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: EntityKey, value: Option<Bytes>) -> HaResult<Option<Bytes>> {
        match value {
            Some(v) => Ok(self.entries.insert(key, v)),
            None => Ok(self.entries.remove(&key).map(|(_, v)| v)),
        }
    }

    async fn scan(&self, entity_type: Option<&str>) -> HaResult<Vec<(EntityKey, Bytes)>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| entity_type.is_none_or(|t| e.key().entity_type == t))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }

    async fn clear(&self) -> HaResult<()> {
        self.entries.clear();
        Ok(())
    }
}

/// Outcome of applying a remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The record's identity was already applied; nothing changed.
    Duplicate,
}

/// Change-record producing wrapper around a [`StateStore`].
pub struct ReplicatedStore {
    origin: NodeId,
    backend: Arc<dyn StateStore>,
    /// Sequence of the last locally generated record.
    last_sequence: AtomicU64,
    /// Epoch stamped onto locally generated records. The arbiter updates
    /// it on every role transition.
    current_epoch: AtomicU64,
    /// Highest applied sequence per origin, this node included.
    highwaters: DashMap<NodeId, u64>,
    /// Local changes made while degraded, awaiting reconciliation.
    divergence_log: Mutex<Vec<ChangeRecord>>,
    degraded: AtomicBool,
    feed: broadcast::Sender<ChangeRecord>,
}

impl ReplicatedStore {
    pub fn new(origin: NodeId, backend: Arc<dyn StateStore>) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            origin,
            backend,
            last_sequence: AtomicU64::new(0),
            current_epoch: AtomicU64::new(0),
            highwaters: DashMap::new(),
            divergence_log: Mutex::new(Vec::new()),
            degraded: AtomicBool::new(false),
            feed,
        }
    }

    pub fn in_memory(origin: NodeId) -> Self {
        Self::new(origin, Arc::new(MemoryStateStore::new()))
    }

    pub fn origin(&self) -> &NodeId {
        &self.origin
    }

    pub fn backend(&self) -> &Arc<dyn StateStore> {
        &self.backend
    }

    /// Subscribe to locally generated change records.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeRecord> {
        self.feed.subscribe()
    }

    /// Epoch currently stamped onto local records.
    pub fn epoch(&self) -> Epoch {
        Epoch::new(self.current_epoch.load(Ordering::SeqCst))
    }

    /// Called by the arbiter whenever the node's epoch changes.
    pub fn set_epoch(&self, epoch: Epoch) {
        self.current_epoch.store(epoch.value(), Ordering::SeqCst);
    }

    /// Mark the node degraded (serving without peers) or healthy.
    ///
    /// While degraded, local changes are copied into the divergence log.
    pub fn set_degraded(&self, degraded: bool) {
        let was = self.degraded.swap(degraded, Ordering::SeqCst);
        if was != degraded {
            info!(degraded, "Store degraded-mode flag changed");
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Write an entity locally, producing a change record.
    pub async fn set(&self, key: EntityKey, value: Bytes) -> HaResult<ChangeRecord> {
        self.mutate(key, Some(value)).await
    }

    /// Delete an entity locally, producing a deletion record.
    pub async fn delete(&self, key: EntityKey) -> HaResult<ChangeRecord> {
        self.mutate(key, None).await
    }

    async fn mutate(&self, key: EntityKey, value: Option<Bytes>) -> HaResult<ChangeRecord> {
        let old_value = self.backend.put(key.clone(), value.clone()).await?;
        let sequence = Sequence::new(self.last_sequence.fetch_add(1, Ordering::SeqCst) + 1);

        let record = ChangeRecord {
            origin: self.origin.clone(),
            sequence,
            epoch: self.epoch(),
            entity_key: key,
            old_value,
            new_value: value,
            timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
        };

        self.highwaters
            .insert(self.origin.clone(), sequence.value());

        if self.degraded.load(Ordering::SeqCst) {
            self.divergence_log
                .lock()
                .expect("divergence log lock poisoned")
                .push(record.clone());
        }

        // Nobody listening just means no peers are connected yet
        let _ = self.feed.send(record.clone());
        Ok(record)
    }

    /// Apply a record generated by another node.
    ///
    /// The caller (the replication receiver) guarantees per-origin
    /// ordering; the store only guards against replays.
    pub async fn apply_remote(&self, record: &ChangeRecord) -> HaResult<ApplyOutcome> {
        let highwater = self
            .highwaters
            .get(&record.origin)
            .map(|h| *h)
            .unwrap_or(0);
        if record.sequence.value() <= highwater {
            debug!(
                origin = %record.origin,
                sequence = record.sequence.value(),
                highwater,
                "Duplicate record ignored"
            );
            return Ok(ApplyOutcome::Duplicate);
        }

        self.backend
            .put(record.entity_key.clone(), record.new_value.clone())
            .await?;
        self.highwaters
            .insert(record.origin.clone(), record.sequence.value());
        metrics::RECORDS_APPLIED
            .with_label_values(&[record.origin.as_str()])
            .inc();
        Ok(ApplyOutcome::Applied)
    }

    /// Highest applied sequence from an origin.
    pub fn highwater(&self, origin: &NodeId) -> Sequence {
        Sequence::new(self.highwaters.get(origin).map(|h| *h).unwrap_or(0))
    }

    /// All per-origin highwaters, for snapshots and status.
    pub fn highwaters(&self) -> HashMap<NodeId, u64> {
        self.highwaters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Current value of an entity.
    pub async fn get(&self, key: &EntityKey) -> HaResult<Option<Bytes>> {
        self.backend.get(key).await
    }

    /// Export the full contents for a snapshot.
    pub async fn dump(&self) -> HaResult<(Vec<(EntityKey, Bytes)>, HashMap<NodeId, u64>)> {
        let entries = self.backend.scan(None).await?;
        Ok((entries, self.highwaters()))
    }

    /// Replace the full contents from a snapshot.
    ///
    /// The local origin's sequence counter is advanced past the snapshot's
    /// highwater for this node so post-resync local records never collide
    /// with pre-resync ones.
    pub async fn install(
        &self,
        entries: Vec<(EntityKey, Bytes)>,
        highwaters: HashMap<NodeId, u64>,
    ) -> HaResult<()> {
        self.backend.clear().await?;
        let count = entries.len();
        for (key, value) in entries {
            self.backend.put(key, Some(value)).await?;
        }

        self.highwaters.clear();
        for (origin, hw) in highwaters {
            if origin == self.origin {
                let current = self.last_sequence.load(Ordering::SeqCst);
                if hw > current {
                    self.last_sequence.store(hw, Ordering::SeqCst);
                }
            }
            self.highwaters.insert(origin, hw);
        }

        info!(entries = count, "Snapshot installed");
        Ok(())
    }

    /// Drain the divergence log accumulated while degraded.
    pub fn drain_divergence(&self) -> Vec<ChangeRecord> {
        std::mem::take(
            &mut *self
                .divergence_log
                .lock()
                .expect("divergence log lock poisoned"),
        )
    }

    /// Number of entries currently in the divergence log.
    pub fn divergence_len(&self) -> usize {
        self.divergence_log
            .lock()
            .expect("divergence log lock poisoned")
            .len()
    }
}

impl std::fmt::Debug for ReplicatedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedStore")
            .field("origin", &self.origin)
            .field("epoch", &self.epoch())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ReplicatedStore {
        let s = ReplicatedStore::in_memory(NodeId::from("fw-a"));
        s.set_epoch(Epoch::new(1));
        s
    }

    fn key(k: &str) -> EntityKey {
        EntityKey::new("dhcp-lease", k)
    }

    fn remote_record(origin: &str, seq: u64, k: &str, value: Option<&[u8]>) -> ChangeRecord {
        ChangeRecord {
            origin: NodeId::from(origin),
            sequence: Sequence::new(seq),
            epoch: Epoch::new(1),
            entity_key: key(k),
            old_value: None,
            new_value: value.map(Bytes::copy_from_slice),
            timestamp_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_set_produces_sequenced_records() {
        let store = store();

        let r1 = store.set(key("k1"), Bytes::from_static(b"v1")).await.unwrap();
        let r2 = store.set(key("k2"), Bytes::from_static(b"v2")).await.unwrap();

        assert_eq!(r1.sequence, Sequence::new(1));
        assert_eq!(r2.sequence, Sequence::new(2));
        assert_eq!(r1.origin, NodeId::from("fw-a"));
        assert_eq!(r1.epoch, Epoch::new(1));
        assert_eq!(store.highwater(&NodeId::from("fw-a")), Sequence::new(2));
    }

    #[tokio::test]
    async fn test_set_captures_old_value() {
        let store = store();

        store.set(key("k"), Bytes::from_static(b"v1")).await.unwrap();
        let r = store.set(key("k"), Bytes::from_static(b"v2")).await.unwrap();

        assert_eq!(r.old_value, Some(Bytes::from_static(b"v1")));
        assert_eq!(r.new_value, Some(Bytes::from_static(b"v2")));
    }

    #[tokio::test]
    async fn test_delete_produces_deletion_record() {
        let store = store();

        store.set(key("k"), Bytes::from_static(b"v")).await.unwrap();
        let r = store.delete(key("k")).await.unwrap();

        assert!(r.is_deletion());
        assert_eq!(r.old_value, Some(Bytes::from_static(b"v")));
        assert_eq!(store.get(&key("k")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_records_published_on_feed() {
        let store = store();
        let mut feed = store.subscribe();

        store.set(key("k"), Bytes::from_static(b"v")).await.unwrap();
        let record = feed.recv().await.unwrap();
        assert_eq!(record.entity_key, key("k"));
    }

    #[tokio::test]
    async fn test_apply_remote_in_order() {
        let store = store();

        let outcome = store
            .apply_remote(&remote_record("fw-b", 1, "k1", Some(b"v1")))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(
            store.get(&key("k1")).await.unwrap(),
            Some(Bytes::from_static(b"v1"))
        );
        assert_eq!(store.highwater(&NodeId::from("fw-b")), Sequence::new(1));
    }

    #[tokio::test]
    async fn test_apply_remote_duplicate_is_noop() {
        let store = store();

        store
            .apply_remote(&remote_record("fw-b", 1, "k", Some(b"v1")))
            .await
            .unwrap();
        store
            .apply_remote(&remote_record("fw-b", 2, "k", Some(b"v2")))
            .await
            .unwrap();

        // Replay of sequence 1 must not clobber the newer value
        let outcome = store
            .apply_remote(&remote_record("fw-b", 1, "k", Some(b"v1")))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Duplicate);
        assert_eq!(
            store.get(&key("k")).await.unwrap(),
            Some(Bytes::from_static(b"v2"))
        );
    }

    #[tokio::test]
    async fn test_apply_remote_deletion() {
        let store = store();

        store
            .apply_remote(&remote_record("fw-b", 1, "k", Some(b"v")))
            .await
            .unwrap();
        store
            .apply_remote(&remote_record("fw-b", 2, "k", None))
            .await
            .unwrap();
        assert_eq!(store.get(&key("k")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_divergence_log_only_while_degraded() {
        let store = store();

        store.set(key("a"), Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(store.divergence_len(), 0);

        store.set_degraded(true);
        store.set(key("b"), Bytes::from_static(b"2")).await.unwrap();
        store.delete(key("a")).await.unwrap();
        assert_eq!(store.divergence_len(), 2);

        store.set_degraded(false);
        store.set(key("c"), Bytes::from_static(b"3")).await.unwrap();
        assert_eq!(store.divergence_len(), 2);

        let drained = store.drain_divergence();
        assert_eq!(drained.len(), 2);
        assert_eq!(store.divergence_len(), 0);
    }

    #[tokio::test]
    async fn test_dump_and_install() {
        let source = store();
        source.set(key("k1"), Bytes::from_static(b"v1")).await.unwrap();
        source.set(key("k2"), Bytes::from_static(b"v2")).await.unwrap();

        let (entries, highwaters) = source.dump().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(highwaters.get(&NodeId::from("fw-a")), Some(&2));

        let target = ReplicatedStore::in_memory(NodeId::from("fw-b"));
        target.install(entries, highwaters).await.unwrap();
        assert_eq!(
            target.get(&key("k1")).await.unwrap(),
            Some(Bytes::from_static(b"v1"))
        );
        assert_eq!(target.highwater(&NodeId::from("fw-a")), Sequence::new(2));
    }

    #[tokio::test]
    async fn test_install_advances_local_sequence() {
        let store = store();
        let mut highwaters = HashMap::new();
        // A snapshot that already contains our own records up to 10
        highwaters.insert(NodeId::from("fw-a"), 10);
        store.install(Vec::new(), highwaters).await.unwrap();

        let r = store.set(key("k"), Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(r.sequence, Sequence::new(11));
    }

    #[tokio::test]
    async fn test_epoch_stamped_onto_records() {
        let store = store();
        store.set_epoch(Epoch::new(5));
        let r = store.set(key("k"), Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(r.epoch, Epoch::new(5));
    }

    #[tokio::test]
    async fn test_memory_store_scan_by_type() {
        let backend = MemoryStateStore::new();
        backend
            .put(EntityKey::new("dhcp-lease", "a"), Some(Bytes::from_static(b"1")))
            .await
            .unwrap();
        backend
            .put(EntityKey::new("dns-record", "b"), Some(Bytes::from_static(b"2")))
            .await
            .unwrap();

        let leases = backend.scan(Some("dhcp-lease")).await.unwrap();
        assert_eq!(leases.len(), 1);
        let all = backend.scan(None).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}

//! Snapshot-based state resynchronization.
//!
//! Incremental replication covers the common case; a snapshot transfer
//! covers everything else: a node joining fresh, a reorder-buffer gap that
//! could not be bridged, a checksum mismatch, or a partition long enough
//! that replaying the backlog record-by-record would take longer than
//! shipping the whole store.
//!
//! A snapshot is the full store contents plus the per-origin applied
//! highwaters, serialized to JSON and guarded by a CRC-32C checksum. The
//! frame layer compresses it on the wire when that pays off.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::{HaError, HaResult};
use super::metrics;
use super::store::ReplicatedStore;
use crate::protocol::snapshot_checksum;
use crate::types::{Epoch, EntityKey, NodeId};

/// What prompted a resync. Used as a metric label and in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncTrigger {
    /// A node with no state joined or restarted.
    Startup,
    /// The reorder buffer declared an unbridgeable sequence gap.
    SequenceGap,
    /// A snapshot failed checksum verification and must be resent.
    ChecksumMismatch,
    /// A partition outlasted the incremental catch-up threshold.
    Partition,
    /// The periodic safety-net resync interval elapsed.
    Scheduled,
    /// Operator requested it.
    Manual,
}

impl ResyncTrigger {
    pub fn as_label(&self) -> &'static str {
        match self {
            ResyncTrigger::Startup => "startup",
            ResyncTrigger::SequenceGap => "sequence_gap",
            ResyncTrigger::ChecksumMismatch => "checksum_mismatch",
            ResyncTrigger::Partition => "partition",
            ResyncTrigger::Scheduled => "scheduled",
            ResyncTrigger::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ResyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// One entity in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: EntityKey,
    pub value: Vec<u8>,
}

/// Full-state snapshot of a node's replicated store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Node the snapshot was taken on.
    pub source: NodeId,
    /// Epoch on the source when the snapshot was taken.
    pub epoch: Epoch,
    /// Wall-clock capture time, epoch milliseconds.
    pub taken_at_ms: u64,
    pub entries: Vec<SnapshotEntry>,
    /// Per-origin applied highwaters at capture time.
    pub highwaters: HashMap<NodeId, u64>,
}

impl Snapshot {
    /// Capture the current store contents.
    pub async fn capture(store: &ReplicatedStore) -> HaResult<Self> {
        let (entries, highwaters) = store.dump().await?;
        Ok(Self {
            source: store.origin().clone(),
            epoch: store.epoch(),
            taken_at_ms: chrono::Utc::now().timestamp_millis() as u64,
            entries: entries
                .into_iter()
                .map(|(key, value)| SnapshotEntry {
                    key,
                    value: value.to_vec(),
                })
                .collect(),
            highwaters,
        })
    }

    /// Serialize for transfer. Returns the payload and its checksum.
    pub fn encode(&self) -> HaResult<(Bytes, u32)> {
        let data = serde_json::to_vec(self)?;
        let checksum = snapshot_checksum(&data);
        metrics::SNAPSHOT_SIZE
            .with_label_values(&["send"])
            .observe(data.len() as f64);
        Ok((Bytes::from(data), checksum))
    }

    /// Verify and deserialize a received snapshot.
    ///
    /// `sender` is the peer the data came from, for error attribution.
    pub fn decode(sender: &NodeId, data: &Bytes, expected_checksum: u32) -> HaResult<Self> {
        let computed = snapshot_checksum(data);
        if computed != expected_checksum {
            warn!(
                sender = %sender,
                expected = format_args!("{:#010x}", expected_checksum),
                computed = format_args!("{:#010x}", computed),
                "Snapshot checksum mismatch"
            );
            metrics::SNAPSHOT_CHECKSUM_FAILURES.inc();
            return Err(HaError::SnapshotCorrupt {
                origin: sender.clone(),
                expected: expected_checksum,
                computed,
            });
        }

        metrics::SNAPSHOT_SIZE
            .with_label_values(&["receive"])
            .observe(data.len() as f64);
        Ok(serde_json::from_slice(data)?)
    }

    /// Install this snapshot into a store, replacing its contents.
    pub async fn install(self, store: &ReplicatedStore) -> HaResult<()> {
        info!(
            source = %self.source,
            entries = self.entries.len(),
            epoch = self.epoch.value(),
            "Installing snapshot"
        );
        let entries = self
            .entries
            .into_iter()
            .map(|e| (e.key, Bytes::from(e.value)))
            .collect();
        store.install(entries, self.highwaters).await
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Record a resync attempt outcome.
pub fn record_resync(trigger: ResyncTrigger, success: bool) {
    let status = if success { "success" } else { "failure" };
    metrics::RESYNCS
        .with_label_values(&[trigger.as_label(), status])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated_store() -> ReplicatedStore {
        ReplicatedStore::in_memory(NodeId::from("fw-a"))
    }

    fn key(k: &str) -> EntityKey {
        EntityKey::new("dhcp-lease", k)
    }

    #[tokio::test]
    async fn test_capture_encode_decode_install() {
        let source = populated_store();
        source.set_epoch(Epoch::new(3));
        source
            .set(key("k1"), Bytes::from_static(b"v1"))
            .await
            .unwrap();
        source
            .set(key("k2"), Bytes::from_static(b"v2"))
            .await
            .unwrap();

        let snapshot = Snapshot::capture(&source).await.unwrap();
        assert_eq!(snapshot.entry_count(), 2);
        assert_eq!(snapshot.epoch, Epoch::new(3));

        let (data, checksum) = snapshot.encode().unwrap();
        let decoded = Snapshot::decode(&NodeId::from("fw-a"), &data, checksum).unwrap();

        let target = ReplicatedStore::in_memory(NodeId::from("fw-b"));
        decoded.install(&target).await.unwrap();

        assert_eq!(
            target.get(&key("k1")).await.unwrap(),
            Some(Bytes::from_static(b"v1"))
        );
        assert_eq!(
            target.highwater(&NodeId::from("fw-a")).value(),
            2,
            "highwaters travel with the snapshot"
        );
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_rejected() {
        let source = populated_store();
        source.set(key("k"), Bytes::from_static(b"v")).await.unwrap();

        let snapshot = Snapshot::capture(&source).await.unwrap();
        let (data, checksum) = snapshot.encode().unwrap();

        let mut corrupted = data.to_vec();
        corrupted[0] ^= 0xFF;
        let err =
            Snapshot::decode(&NodeId::from("fw-a"), &Bytes::from(corrupted), checksum).unwrap_err();
        assert!(matches!(err, HaError::SnapshotCorrupt { .. }));
        assert!(err.needs_resync());
    }

    #[tokio::test]
    async fn test_wrong_checksum_rejected() {
        let source = populated_store();
        let snapshot = Snapshot::capture(&source).await.unwrap();
        let (data, checksum) = snapshot.encode().unwrap();

        let err =
            Snapshot::decode(&NodeId::from("fw-a"), &data, checksum.wrapping_add(1)).unwrap_err();
        assert!(matches!(err, HaError::SnapshotCorrupt { .. }));
    }

    #[tokio::test]
    async fn test_empty_store_snapshot() {
        let source = populated_store();
        let snapshot = Snapshot::capture(&source).await.unwrap();
        assert_eq!(snapshot.entry_count(), 0);

        let (data, checksum) = snapshot.encode().unwrap();
        let decoded = Snapshot::decode(&NodeId::from("fw-a"), &data, checksum).unwrap();
        assert_eq!(decoded.entry_count(), 0);
    }

    #[test]
    fn test_trigger_labels() {
        assert_eq!(ResyncTrigger::SequenceGap.as_label(), "sequence_gap");
        assert_eq!(format!("{}", ResyncTrigger::Manual), "manual");
    }
}

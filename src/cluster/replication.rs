//! Change-record replication: ordered delivery in, acked fan-out.
//!
//! # Receive path
//!
//! [`ReorderBuffer`] enforces per-origin ordering. Records arriving in
//! sequence are released immediately; records arriving early are held
//! until the gap fills. A gap that outgrows the buffer means records were
//! lost for good and the origin's stream needs a snapshot resync.
//!
//! Epoch filtering happens here too: once a record with epoch `E` from an
//! origin has been seen, records from that origin with a lower epoch are
//! rejected. This is what neutralizes writes from a deposed primary after
//! a failover.
//!
//! # Send path
//!
//! [`OutboundQueue`] keeps locally generated records until the peer
//! acknowledges them. Acks are cumulative (highest contiguously applied
//! sequence), so one ack can retire many records. On reconnect the whole
//! queue is retransmitted; the receiving side's replay guard makes that
//! safe.

use std::collections::{BTreeMap, VecDeque};

use dashmap::DashMap;
use tracing::{debug, warn};

use super::error::{HaError, HaResult};
use super::metrics;
use crate::types::{ChangeRecord, Epoch, NodeId, Sequence};

/// Outcome of offering one record to the reorder buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferOutcome {
    /// The record (and possibly buffered successors) are ready to apply,
    /// in order.
    Ready(Vec<ChangeRecord>),
    /// The record arrived early and was buffered.
    Buffered,
    /// The record was already applied or buffered; ignored.
    Duplicate,
    /// The record carries an epoch older than one already seen from its
    /// origin; rejected.
    StaleEpoch,
}

#[derive(Debug)]
struct OriginStream {
    /// Next sequence to release.
    next_expected: u64,
    /// Highest epoch observed from this origin.
    highest_epoch: Epoch,
    /// Early arrivals keyed by sequence.
    pending: BTreeMap<u64, ChangeRecord>,
}

impl OriginStream {
    fn new(applied_highwater: u64) -> Self {
        Self {
            next_expected: applied_highwater + 1,
            highest_epoch: Epoch::default(),
            pending: BTreeMap::new(),
        }
    }
}

/// Per-origin reorder buffer for the replication receive path.
pub struct ReorderBuffer {
    /// Maximum records buffered per origin before a gap is declared fatal.
    capacity: usize,
    streams: DashMap<NodeId, OriginStream>,
}

impl ReorderBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            streams: DashMap::new(),
        }
    }

    /// Initialize (or reset) an origin's stream at a known applied
    /// highwater. Called at startup and after installing a snapshot.
    pub fn reset_origin(&self, origin: NodeId, applied_highwater: Sequence) {
        debug!(
            origin = %origin,
            highwater = applied_highwater.value(),
            "Resetting reorder stream"
        );
        self.streams
            .insert(origin, OriginStream::new(applied_highwater.value()));
    }

    /// Offer an incoming record.
    ///
    /// `Err(SequenceGap)` means the buffer overflowed waiting for a
    /// missing record; the caller must request a resync for the origin.
    pub fn offer(&self, record: ChangeRecord) -> HaResult<OfferOutcome> {
        let origin = record.origin.clone();
        let mut stream = self
            .streams
            .entry(origin.clone())
            .or_insert_with(|| OriginStream::new(0));

        // Epoch filter first: a stale-epoch record is invalid even if its
        // sequence would otherwise fit.
        if record.epoch < stream.highest_epoch {
            warn!(
                origin = %origin,
                record_epoch = record.epoch.value(),
                highest_epoch = stream.highest_epoch.value(),
                sequence = record.sequence.value(),
                "Rejecting record with stale epoch"
            );
            metrics::RECORDS_REJECTED
                .with_label_values(&[origin.as_str(), "stale_epoch"])
                .inc();
            return Ok(OfferOutcome::StaleEpoch);
        }
        stream.highest_epoch = record.epoch;

        let seq = record.sequence.value();
        if seq < stream.next_expected || stream.pending.contains_key(&seq) {
            metrics::RECORDS_REJECTED
                .with_label_values(&[origin.as_str(), "duplicate"])
                .inc();
            return Ok(OfferOutcome::Duplicate);
        }

        if seq == stream.next_expected {
            // Release this record plus any contiguous run behind it
            let mut ready = vec![record];
            let mut next = seq + 1;
            while let Some(buffered) = stream.pending.remove(&next) {
                ready.push(buffered);
                next += 1;
            }
            stream.next_expected = next;
            metrics::REORDER_BUFFERED
                .with_label_values(&[origin.as_str()])
                .set(stream.pending.len() as i64);
            return Ok(OfferOutcome::Ready(ready));
        }

        // Early arrival
        if stream.pending.len() >= self.capacity {
            let expected = Sequence::new(stream.next_expected);
            let highest_buffered = stream
                .pending
                .keys()
                .next_back()
                .copied()
                .map(Sequence::new)
                .unwrap_or(record.sequence);
            // Drop the stream state; it will be rebuilt after resync
            drop(stream);
            self.streams.remove(&origin);
            metrics::RECORDS_REJECTED
                .with_label_values(&[origin.as_str(), "gap_overflow"])
                .inc();
            return Err(HaError::SequenceGap {
                origin,
                expected,
                highest_buffered,
            });
        }

        stream.pending.insert(seq, record);
        metrics::REORDER_BUFFERED
            .with_label_values(&[origin.as_str()])
            .set(stream.pending.len() as i64);
        Ok(OfferOutcome::Buffered)
    }

    /// Number of records currently buffered for an origin.
    pub fn buffered(&self, origin: &NodeId) -> usize {
        self.streams
            .get(origin)
            .map(|s| s.pending.len())
            .unwrap_or(0)
    }

    /// Next sequence the buffer will release for an origin.
    pub fn next_expected(&self, origin: &NodeId) -> Option<Sequence> {
        self.streams
            .get(origin)
            .map(|s| Sequence::new(s.next_expected))
    }
}

impl std::fmt::Debug for ReorderBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReorderBuffer")
            .field("capacity", &self.capacity)
            .field("origins", &self.streams.len())
            .finish()
    }
}

/// Unacked-record queue for one peer link.
///
/// Owned by the connection task for that peer. Not thread-safe by itself;
/// wrap in a mutex if shared.
#[derive(Debug)]
pub struct OutboundQueue {
    peer: NodeId,
    max_unacked: usize,
    queue: VecDeque<ChangeRecord>,
}

impl OutboundQueue {
    pub fn new(peer: NodeId, max_unacked: usize) -> Self {
        Self {
            peer,
            max_unacked: max_unacked.max(1),
            queue: VecDeque::new(),
        }
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    pub fn unacked(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue a record for delivery.
    ///
    /// An overflow means the peer has fallen too far behind to catch up
    /// record-by-record; the caller clears the link and schedules a
    /// snapshot resync instead. The queue is emptied so the link can
    /// carry fresh records once the resync completes.
    pub fn enqueue(&mut self, record: ChangeRecord) -> HaResult<()> {
        if self.queue.len() >= self.max_unacked {
            let expected = self
                .queue
                .front()
                .map(|r| r.sequence)
                .unwrap_or(record.sequence);
            warn!(
                peer = %self.peer,
                unacked = self.queue.len(),
                "Unacked queue overflow, peer needs a resync"
            );
            self.queue.clear();
            self.update_gauge();
            return Err(HaError::SequenceGap {
                origin: self.peer.clone(),
                expected,
                highest_buffered: record.sequence,
            });
        }
        self.queue.push_back(record);
        self.update_gauge();
        Ok(())
    }

    /// Retire every record up to and including the acked sequence.
    ///
    /// Acks are cumulative; an ack below the queue head is a stale
    /// duplicate and retires nothing.
    pub fn ack(&mut self, acked: Sequence) -> usize {
        let before = self.queue.len();
        while let Some(front) = self.queue.front() {
            if front.sequence <= acked {
                self.queue.pop_front();
            } else {
                break;
            }
        }
        self.update_gauge();
        before - self.queue.len()
    }

    /// Records to retransmit after a reconnect, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.queue.iter()
    }

    /// Drop everything queued.
    ///
    /// Used when this node fences: divergent records written before the
    /// fence must go through reconciliation, not blind retransmission.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        self.update_gauge();
        dropped
    }

    fn update_gauge(&self) {
        metrics::UNACKED_RECORDS
            .with_label_values(&[self.peer.as_str()])
            .set(self.queue.len() as i64);
    }
}

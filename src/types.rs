//! Type-safe wrappers for the coordination-protocol primitives.
//!
//! These newtypes keep epochs, sequences and node identities from being
//! mixed up even though several of them share an underlying representation.
//! `ChangeRecord` lives here as well because both the wire protocol and the
//! cluster layer speak it.

use bytes::{BufMut, Bytes};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::encode::ToByte;
use crate::error::Result;

/// A cluster node identifier.
///
/// Node ids are operator-assigned strings (e.g. `"fw-a"`). Election ties
/// break on their lexical ordering, so `Ord` is derived deliberately.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a new node id.
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    /// Get the raw string value.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        NodeId(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToByte for NodeId {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.0.encode(buffer)
    }
}

/// A promotion epoch.
///
/// Bumped on every transition into PRIMARY; replicas reject change records
/// carrying an epoch lower than the highest they have observed from an
/// origin, which is what makes stale writes harmless after a failover.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Epoch(pub u64);

impl Epoch {
    /// Create a new epoch from a raw value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        Epoch(value)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The epoch following this one.
    #[inline]
    pub const fn next(self) -> Self {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToByte for Epoch {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.0.encode(buffer)
    }
}

/// A per-origin monotonic sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Sequence(pub u64);

impl Sequence {
    /// Create a new sequence from a raw value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        Sequence(value)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The sequence following this one.
    #[inline]
    pub const fn next(self) -> Self {
        Sequence(self.0 + 1)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToByte for Sequence {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.0.encode(buffer)
    }
}

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Role {
    /// Process started, initial election not yet decided.
    #[default]
    Init,
    /// Actively serving traffic and owning the virtual resources.
    Primary,
    /// Standing by, replicating state, ready to promote.
    Backup,
    /// Lost quorum while primary; barred from serving until reconciled.
    Fenced,
}

impl Role {
    /// Wire encoding of the role.
    pub const fn as_wire(self) -> u8 {
        match self {
            Role::Init => 0,
            Role::Primary => 1,
            Role::Backup => 2,
            Role::Fenced => 3,
        }
    }

    /// Decode a role from its wire value.
    pub const fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Role::Init),
            1 => Some(Role::Primary),
            2 => Some(Role::Backup),
            3 => Some(Role::Fenced),
            _ => None,
        }
    }

    /// True while the node is allowed to serve traffic.
    #[inline]
    pub const fn is_serving(self) -> bool {
        matches!(self, Role::Primary)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Init => write!(f, "init"),
            Role::Primary => write!(f, "primary"),
            Role::Backup => write!(f, "backup"),
            Role::Fenced => write!(f, "fenced"),
        }
    }
}

/// Identifies a replicated entity: a typed namespace plus a key within it.
///
/// Entity types are operator-configured ("dhcp-lease", "dns-record",
/// "learned-rule", ...); this engine treats them as opaque namespaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity namespace, e.g. `"dhcp-lease"`.
    pub entity_type: String,
    /// Key within the namespace, e.g. a MAC address.
    pub key: String,
}

impl EntityKey {
    /// Create a new entity key.
    pub fn new(entity_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.key)
    }
}

/// Identity of a change record: `(origin, sequence)`.
///
/// Replaying the same identity at a replica must be a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub origin: NodeId,
    pub sequence: Sequence,
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.sequence)
    }
}

/// A single replicated state mutation.
///
/// Produced by State-Store mutation hooks on the origin node, streamed to
/// every peer, applied there in per-origin sequence order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Node that generated the mutation.
    pub origin: NodeId,
    /// Monotonic per-origin sequence number.
    pub sequence: Sequence,
    /// Epoch active on the origin when the mutation was generated.
    pub epoch: Epoch,
    /// Entity being mutated.
    pub entity_key: EntityKey,
    /// Previous value, `None` for creations.
    #[serde(with = "opt_bytes_serde")]
    pub old_value: Option<Bytes>,
    /// New value, `None` for deletions.
    #[serde(with = "opt_bytes_serde")]
    pub new_value: Option<Bytes>,
    /// Wall-clock time of the mutation, epoch milliseconds.
    pub timestamp_ms: u64,
}

impl ChangeRecord {
    /// The record's identity.
    pub fn id(&self) -> RecordId {
        RecordId {
            origin: self.origin.clone(),
            sequence: self.sequence,
        }
    }

    /// True when this record deletes the entity.
    pub fn is_deletion(&self) -> bool {
        self.new_value.is_none()
    }
}

/// Serde bridge for `Option<Bytes>` used in snapshot payloads.
mod opt_bytes_serde {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Bytes>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(b) => ser.serialize_some(&b.to_vec()),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Bytes>, D::Error> {
        let v: Option<Vec<u8>> = Option::deserialize(de)?;
        Ok(v.map(Bytes::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_ordering_is_lexical() {
        assert!(NodeId::from("fw-a") < NodeId::from("fw-b"));
        assert!(NodeId::from("a") < NodeId::from("ab"));
    }

    #[test]
    fn test_node_id_display() {
        assert_eq!(format!("{}", NodeId::from("fw-a")), "fw-a");
    }

    #[test]
    fn test_epoch_next() {
        assert_eq!(Epoch::new(1).next(), Epoch::new(2));
        assert_eq!(Epoch::default().next().value(), 1);
    }

    #[test]
    fn test_epoch_ordering() {
        assert!(Epoch::new(1) < Epoch::new(2));
        assert_eq!(Epoch::new(3), Epoch::new(3));
    }

    #[test]
    fn test_epoch_encode() {
        let mut buf = Vec::new();
        Epoch::new(0x0102030405060708).encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn test_sequence_next() {
        assert_eq!(Sequence::new(41).next(), Sequence::new(42));
    }

    #[test]
    fn test_role_wire_round_trip() {
        for role in [Role::Init, Role::Primary, Role::Backup, Role::Fenced] {
            assert_eq!(Role::from_wire(role.as_wire()), Some(role));
        }
        assert_eq!(Role::from_wire(99), None);
    }

    #[test]
    fn test_role_is_serving() {
        assert!(Role::Primary.is_serving());
        assert!(!Role::Backup.is_serving());
        assert!(!Role::Fenced.is_serving());
        assert!(!Role::Init.is_serving());
    }

    #[test]
    fn test_role_display() {
        assert_eq!(format!("{}", Role::Primary), "primary");
        assert_eq!(format!("{}", Role::Fenced), "fenced");
    }

    #[test]
    fn test_entity_key_display() {
        let key = EntityKey::new("dhcp-lease", "aa:bb:cc:dd:ee:ff");
        assert_eq!(format!("{}", key), "dhcp-lease/aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_record_identity_equality() {
        let a = RecordId {
            origin: NodeId::from("fw-a"),
            sequence: Sequence::new(7),
        };
        let b = RecordId {
            origin: NodeId::from("fw-a"),
            sequence: Sequence::new(7),
        };
        assert_eq!(a, b);

        let c = RecordId {
            origin: NodeId::from("fw-b"),
            sequence: Sequence::new(7),
        };
        assert_ne!(a, c);
    }

    #[test]
    fn test_change_record_is_deletion() {
        let record = ChangeRecord {
            origin: NodeId::from("fw-a"),
            sequence: Sequence::new(1),
            epoch: Epoch::new(1),
            entity_key: EntityKey::new("dhcp-lease", "k"),
            old_value: Some(Bytes::from_static(b"10.0.0.5")),
            new_value: None,
            timestamp_ms: 0,
        };
        assert!(record.is_deletion());
    }

    #[test]
    fn test_change_record_serde_round_trip() {
        let record = ChangeRecord {
            origin: NodeId::from("fw-a"),
            sequence: Sequence::new(9),
            epoch: Epoch::new(2),
            entity_key: EntityKey::new("dns-record", "host.lan"),
            old_value: None,
            new_value: Some(Bytes::from_static(b"10.0.0.9")),
            timestamp_ms: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: ChangeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}

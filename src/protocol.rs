//! Peer wire protocol for the coordination channel.
//!
//! Every message between cooperating nodes is a single framed message:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     frame_length (bytes following this field)
//! 4       1     frame_type (AUTH | HEARTBEAT | CHANGE | ACK | RESYNC_REQUEST | RESYNC_DATA)
//! 5       2+n   sender node id (u16 length + bytes)
//! ..      8     epoch
//! ..      8     sequence
//! ..      1     flags (bit 0: payload is snappy-compressed)
//! ..      *     type-specific payload
//! ```
//!
//! The length prefix is consumed by the connection layer
//! ([`crate::peer::connection`]); everything in this module works on the
//! frame body. RESYNC_DATA payloads carry a CRC-32C checksum that receivers
//! verify before a snapshot is ever applied.

use bytes::{BufMut, Bytes};
use nom::IResult;
use nombytes::NomBytes;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::constants::COMPRESSION_MIN_PAYLOAD;
use crate::encode::{ToByte, encode_nullable_bytes};
use crate::error::{Error, Result};
use crate::parser::{
    bytes_to_string, parse_bytes, parse_nullable_bytes, parse_string, parse_u8, parse_u64,
};
use crate::types::{ChangeRecord, EntityKey, Epoch, NodeId, Role, Sequence};

/// Frame flag: payload is snappy-compressed.
const FLAG_COMPRESSED: u8 = 0b0000_0001;

// CRC-32C (Castagnoli) used for snapshot integrity.
// Table is computed at compile time to avoid a checksum dependency.
const CRC32C_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x82F63B78;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Compute the CRC-32C checksum of a snapshot body.
pub fn snapshot_checksum(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32C_TABLE[index];
    }
    !crc
}

/// Message types on the peer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum FrameType {
    /// Pre-shared-key handshake; must be the first frame on a connection.
    Auth = 0,
    /// Periodic liveness message.
    Heartbeat = 1,
    /// One replicated state mutation.
    Change = 2,
    /// Cumulative acknowledgment of applied change records.
    Ack = 3,
    /// Ask the peer for a full checksummed snapshot.
    ResyncRequest = 4,
    /// Checksummed snapshot transfer.
    ResyncData = 5,
}

/// Type-specific payload of a [`Frame`].
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    Auth {
        /// Cluster shared secret, compared in constant time by the receiver.
        secret: String,
    },
    Heartbeat {
        role: Role,
        timestamp_ms: u64,
    },
    Change(ChangeRecord),
    /// Header `sequence` carries the highest contiguously applied sequence
    /// for the header `sender`'s view of the acked origin.
    Ack,
    ResyncRequest {
        reason: String,
    },
    ResyncData {
        /// CRC-32C of the (uncompressed) snapshot bytes.
        checksum: u32,
        snapshot: Bytes,
    },
}

impl FramePayload {
    fn frame_type(&self) -> FrameType {
        match self {
            FramePayload::Auth { .. } => FrameType::Auth,
            FramePayload::Heartbeat { .. } => FrameType::Heartbeat,
            FramePayload::Change(_) => FrameType::Change,
            FramePayload::Ack => FrameType::Ack,
            FramePayload::ResyncRequest { .. } => FrameType::ResyncRequest,
            FramePayload::ResyncData { .. } => FrameType::ResyncData,
        }
    }
}

/// A single message on the peer channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Node that sent this frame on the link.
    pub sender: NodeId,
    /// Sender's current epoch.
    pub epoch: Epoch,
    /// Per-type sequence: heartbeat counter, change sequence, or ack highwater.
    pub sequence: Sequence,
    pub payload: FramePayload,
}

impl Frame {
    /// The wire type of this frame.
    pub fn frame_type(&self) -> FrameType {
        self.payload.frame_type()
    }

    /// Build a heartbeat frame.
    pub fn heartbeat(
        sender: NodeId,
        epoch: Epoch,
        sequence: Sequence,
        role: Role,
        timestamp_ms: u64,
    ) -> Self {
        Frame {
            sender,
            epoch,
            sequence,
            payload: FramePayload::Heartbeat { role, timestamp_ms },
        }
    }

    /// Build a change frame; the header mirrors the record's identity.
    pub fn change(sender: NodeId, record: ChangeRecord) -> Self {
        Frame {
            sender,
            epoch: record.epoch,
            sequence: record.sequence,
            payload: FramePayload::Change(record),
        }
    }

    /// Build a cumulative ack for `origin`'s records up to `applied`.
    pub fn ack(sender: NodeId, epoch: Epoch, applied: Sequence) -> Self {
        Frame {
            sender,
            epoch,
            sequence: applied,
            payload: FramePayload::Ack,
        }
    }

    /// Encode the frame body (without the length prefix).
    ///
    /// When `compress` is set and the payload is large enough to be worth
    /// it, the payload section is snappy-compressed and the flag bit set.
    pub fn encode(&self, compress: bool) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        self.encode_payload(&mut payload)?;

        let mut flags = 0u8;
        if compress && payload.len() >= COMPRESSION_MIN_PAYLOAD {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(&payload)
                .map_err(|_| Error::MissingData("snappy compression failed".to_string()))?;
            // Only keep the compressed form when it actually shrank
            if compressed.len() < payload.len() {
                payload = compressed;
                flags |= FLAG_COMPRESSED;
            }
        }

        let mut buf = Vec::with_capacity(payload.len() + 32);
        (self.frame_type() as u8).encode(&mut buf)?;
        self.sender.encode(&mut buf)?;
        self.epoch.encode(&mut buf)?;
        self.sequence.encode(&mut buf)?;
        flags.encode(&mut buf)?;
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Encode the frame with its 4-byte length prefix, ready for the socket.
    pub fn encode_with_size(&self, compress: bool) -> Result<Vec<u8>> {
        let body = self.encode(compress)?;
        let mut out = Vec::with_capacity(body.len() + 4);
        (body.len() as u32).encode(&mut out)?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn encode_payload<W: BufMut>(&self, buf: &mut W) -> Result<()> {
        match &self.payload {
            FramePayload::Auth { secret } => secret.encode(buf),
            FramePayload::Heartbeat { role, timestamp_ms } => {
                role.as_wire().encode(buf)?;
                timestamp_ms.encode(buf)
            }
            FramePayload::Change(record) => {
                record.origin.encode(buf)?;
                record.sequence.encode(buf)?;
                record.epoch.encode(buf)?;
                record.entity_key.entity_type.encode(buf)?;
                record.entity_key.key.encode(buf)?;
                encode_nullable_bytes(buf, &record.old_value)?;
                encode_nullable_bytes(buf, &record.new_value)?;
                record.timestamp_ms.encode(buf)
            }
            FramePayload::Ack => Ok(()),
            FramePayload::ResyncRequest { reason } => reason.encode(buf),
            FramePayload::ResyncData { checksum, snapshot } => {
                checksum.encode(buf)?;
                snapshot.encode(buf)
            }
        }
    }

    /// Parse a frame body (the bytes after the length prefix).
    pub fn parse(data: Bytes) -> Result<Frame> {
        match parse_frame(NomBytes::new(data.clone())) {
            Ok((_, frame)) => Ok(frame),
            Err(_) => Err(Error::ParsingError(data)),
        }
    }
}

fn parse_frame(s: NomBytes) -> IResult<NomBytes, Frame> {
    let (s, type_byte) = parse_u8(s)?;
    let frame_type = FrameType::from_u8(type_byte).ok_or_else(|| {
        nom::Err::Failure(nom::error::Error::new(
            s.clone(),
            nom::error::ErrorKind::Verify,
        ))
    })?;
    let (s, sender_raw) = parse_string(s)?;
    let sender = NodeId::from(bytes_to_string(&sender_raw)?);
    let (s, epoch) = parse_u64(s)?;
    let (s, sequence) = parse_u64(s)?;
    let (s, flags) = parse_u8(s)?;

    // Remaining bytes are the payload; decompress them if flagged.
    let payload_bytes = s.to_bytes();
    let payload_bytes = if flags & FLAG_COMPRESSED != 0 {
        let decompressed = snap::raw::Decoder::new()
            .decompress_vec(&payload_bytes)
            .map_err(|_| {
                nom::Err::Failure(nom::error::Error::new(
                    s.clone(),
                    nom::error::ErrorKind::Verify,
                ))
            })?;
        Bytes::from(decompressed)
    } else {
        payload_bytes
    };

    let p = NomBytes::new(payload_bytes);
    let payload = match frame_type {
        FrameType::Auth => {
            let (_, secret_raw) = parse_string(p)?;
            FramePayload::Auth {
                secret: bytes_to_string(&secret_raw)?,
            }
        }
        FrameType::Heartbeat => {
            let (p2, role_byte) = parse_u8(p)?;
            let role = Role::from_wire(role_byte).ok_or_else(|| {
                nom::Err::Failure(nom::error::Error::new(
                    p2.clone(),
                    nom::error::ErrorKind::Verify,
                ))
            })?;
            let (_, timestamp_ms) = parse_u64(p2)?;
            FramePayload::Heartbeat { role, timestamp_ms }
        }
        FrameType::Change => {
            let (p, origin_raw) = parse_string(p)?;
            let (p, seq) = parse_u64(p)?;
            let (p, rec_epoch) = parse_u64(p)?;
            let (p, entity_type_raw) = parse_string(p)?;
            let (p, key_raw) = parse_string(p)?;
            let (p, old_value) = parse_nullable_bytes(p)?;
            let (p, new_value) = parse_nullable_bytes(p)?;
            let (_, timestamp_ms) = parse_u64(p)?;
            FramePayload::Change(ChangeRecord {
                origin: NodeId::from(bytes_to_string(&origin_raw)?),
                sequence: Sequence::new(seq),
                epoch: Epoch::new(rec_epoch),
                entity_key: EntityKey::new(
                    bytes_to_string(&entity_type_raw)?,
                    bytes_to_string(&key_raw)?,
                ),
                old_value,
                new_value,
                timestamp_ms,
            })
        }
        FrameType::Ack => FramePayload::Ack,
        FrameType::ResyncRequest => {
            let (_, reason_raw) = parse_string(p)?;
            FramePayload::ResyncRequest {
                reason: bytes_to_string(&reason_raw)?,
            }
        }
        FrameType::ResyncData => {
            let (p, checksum) = nom::number::complete::be_u32(p)?;
            let (_, snapshot) = parse_bytes(p)?;
            FramePayload::ResyncData { checksum, snapshot }
        }
    };

    let rest = NomBytes::new(Bytes::new());
    Ok((
        rest,
        Frame {
            sender,
            epoch: Epoch::new(epoch),
            sequence: Sequence::new(sequence),
            payload,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> ChangeRecord {
        ChangeRecord {
            origin: NodeId::from("fw-a"),
            sequence: Sequence::new(17),
            epoch: Epoch::new(3),
            entity_key: EntityKey::new("dhcp-lease", "aa:bb:cc:dd:ee:ff"),
            old_value: Some(Bytes::from_static(b"10.0.0.5")),
            new_value: Some(Bytes::from_static(b"10.0.0.6")),
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_crc32c_known_values() {
        assert_eq!(snapshot_checksum(b""), 0x00000000);
        assert_eq!(snapshot_checksum(b"a"), 0xC1D04330);
        // IETF RFC 3720 test vector
        assert_eq!(snapshot_checksum(b"123456789"), 0xE3069283);
    }

    #[test]
    fn test_heartbeat_frame_round_trip() {
        let frame = Frame::heartbeat(
            NodeId::from("fw-a"),
            Epoch::new(2),
            Sequence::new(99),
            Role::Primary,
            1_700_000_000_000,
        );
        let encoded = frame.encode(false).unwrap();
        let parsed = Frame::parse(Bytes::from(encoded)).unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(parsed.frame_type(), FrameType::Heartbeat);
    }

    #[test]
    fn test_change_frame_round_trip() {
        let frame = Frame::change(NodeId::from("fw-a"), sample_record());
        let encoded = frame.encode(false).unwrap();
        let parsed = Frame::parse(Bytes::from(encoded)).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_change_frame_with_deletion() {
        let mut record = sample_record();
        record.new_value = None;
        let frame = Frame::change(NodeId::from("fw-a"), record.clone());
        let encoded = frame.encode(false).unwrap();
        let parsed = Frame::parse(Bytes::from(encoded)).unwrap();
        match parsed.payload {
            FramePayload::Change(parsed_record) => {
                assert!(parsed_record.is_deletion());
                assert_eq!(parsed_record, record);
            }
            other => panic!("expected change payload, got {:?}", other),
        }
    }

    #[test]
    fn test_ack_frame_round_trip() {
        let frame = Frame::ack(NodeId::from("fw-b"), Epoch::new(5), Sequence::new(41));
        let encoded = frame.encode(false).unwrap();
        let parsed = Frame::parse(Bytes::from(encoded)).unwrap();
        assert_eq!(parsed.sequence, Sequence::new(41));
        assert_eq!(parsed.payload, FramePayload::Ack);
    }

    #[test]
    fn test_resync_data_round_trip_compressed() {
        // Large, repetitive snapshot compresses well
        let snapshot = Bytes::from(vec![b'x'; 4096]);
        let checksum = snapshot_checksum(&snapshot);
        let frame = Frame {
            sender: NodeId::from("fw-a"),
            epoch: Epoch::new(1),
            sequence: Sequence::new(0),
            payload: FramePayload::ResyncData {
                checksum,
                snapshot: snapshot.clone(),
            },
        };
        let encoded = frame.encode(true).unwrap();
        assert!(encoded.len() < snapshot.len());
        let parsed = Frame::parse(Bytes::from(encoded)).unwrap();
        match parsed.payload {
            FramePayload::ResyncData {
                checksum: c,
                snapshot: s,
            } => {
                assert_eq!(c, checksum);
                assert_eq!(s, snapshot);
                assert_eq!(snapshot_checksum(&s), c);
            }
            other => panic!("expected resync data, got {:?}", other),
        }
    }

    #[test]
    fn test_auth_frame_round_trip() {
        let frame = Frame {
            sender: NodeId::from("fw-b"),
            epoch: Epoch::new(0),
            sequence: Sequence::new(0),
            payload: FramePayload::Auth {
                secret: "cluster-secret".to_string(),
            },
        };
        let encoded = frame.encode(false).unwrap();
        let parsed = Frame::parse(Bytes::from(encoded)).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_encode_with_size_prefix() {
        let frame = Frame::ack(NodeId::from("fw-a"), Epoch::new(1), Sequence::new(1));
        let sized = frame.encode_with_size(false).unwrap();
        let body_len = u32::from_be_bytes(sized[0..4].try_into().unwrap()) as usize;
        assert_eq!(body_len, sized.len() - 4);
        let parsed = Frame::parse(Bytes::copy_from_slice(&sized[4..])).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_parse_rejects_unknown_frame_type() {
        let frame = Frame::ack(NodeId::from("fw-a"), Epoch::new(1), Sequence::new(1));
        let mut encoded = frame.encode(false).unwrap();
        encoded[0] = 0xEE;
        assert!(Frame::parse(Bytes::from(encoded)).is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_frame() {
        let frame = Frame::change(NodeId::from("fw-a"), sample_record());
        let encoded = frame.encode(false).unwrap();
        let truncated = Bytes::copy_from_slice(&encoded[..encoded.len() / 2]);
        assert!(Frame::parse(truncated).is_err());
    }

    #[test]
    fn test_small_payload_not_compressed() {
        let frame = Frame::heartbeat(
            NodeId::from("fw-a"),
            Epoch::new(1),
            Sequence::new(1),
            Role::Backup,
            0,
        );
        // Requesting compression on a tiny payload keeps it plain
        let encoded = frame.encode(true).unwrap();
        let parsed = Frame::parse(Bytes::from(encoded)).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_snapshot_checksum_detects_corruption() {
        let snapshot = Bytes::from_static(b"entries-go-here");
        let checksum = snapshot_checksum(&snapshot);
        let mut corrupted = snapshot.to_vec();
        corrupted[3] ^= 0x01;
        assert_ne!(snapshot_checksum(&corrupted), checksum);
    }
}

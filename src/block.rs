// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Block model and wire codec.
//!
//! Everything on the wire is fixed-layout and big-endian. A frame is a 40-byte
//! envelope followed by the 512-byte payload; the subscriber handshake is 22
//! bytes; the out-of-band repair request is 28 bytes. The record kind is
//! classified exactly once, at decode time, and carried on the block.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ReplicationError, Result};

/// Payload size of every block. Data files are flat arrays of these.
pub const PAYLOAD_LEN: usize = 512;
/// Envelope bytes preceding the payload on the wire.
pub const ENVELOPE_LEN: usize = 40;
/// Total frame size, known to both ends.
pub const FRAME_LEN: usize = ENVELOPE_LEN + PAYLOAD_LEN;
/// Subscriber handshake size.
pub const HANDSHAKE_LEN: usize = 22;
/// Out-of-band repair request size.
pub const REPAIR_REQUEST_LEN: usize = 28;

/// Sequences live in `[1, MAX_SEQUENCE]` and wrap back to 1.
pub const MAX_SEQUENCE: u32 = 2_000_000_000;

/// Keepalive record name, emitted when the stream is idle for 15 s.
pub const SENTINEL_HEARTBEAT: [u8; 12] = *b"HEARTBEAT!!!";
/// Placeholder name for repair-path blocks whose true channel must be
/// recovered from the payload.
pub const SENTINEL_REQUESTED: [u8; 12] = *b"REQUESTEDBLK";
/// Operator trigger forcing a full-index re-bootstrap of the addressed file.
pub const SENTINEL_FORCE_LOAD: [u8; 12] = *b"FORCELOADIT!";
/// Internal control-block traffic.
pub const SENTINEL_CONTROL: [u8; 12] = *b"CONTROLBLK  ";

const REPAIR_MAGIC: [u8; 4] = *b"RQST";

/// Reserved `index_pointer` value on a repair request asking for the
/// complete index of the addressed file instead of a data range. The
/// answer is every allocated index block followed by a control end marker.
pub const INDEX_FETCH_POINTER: i32 = -2;

/// Successor in the wrapped sequence space.
#[inline]
pub fn next_sequence(seq: u32) -> u32 {
    if seq >= MAX_SEQUENCE {
        1
    } else {
        seq + 1
    }
}

/// How far `cursor` trails `head`, accounting for wrap. Both must be live
/// sequences in `[1, MAX_SEQUENCE]`.
#[inline]
pub fn seq_distance(head: u32, cursor: u32) -> u64 {
    if head >= cursor {
        u64::from(head - cursor)
    } else {
        u64::from(head) + u64::from(MAX_SEQUENCE - cursor)
    }
}

/// The sequence `n` positions behind `head`, wrapping below 1.
#[inline]
pub fn seq_back(head: u32, n: u32) -> u32 {
    if head > n {
        head - n
    } else {
        MAX_SEQUENCE - (n - head)
    }
}

/// Classified once at decode; replaces repeated string comparison on the
/// record name in every downstream dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Ordinary data block, `block_number >= 0`.
    Data,
    /// Index block addressed by pointer/extent rather than block number.
    Index,
    /// Keepalive, never materialized.
    Heartbeat,
    /// Re-requested block delivered out of band under the placeholder name.
    RepairPlaceholder,
    /// Operator request to re-bootstrap the addressed file.
    ForceLoad,
    /// Internal control traffic, never materialized.
    Control,
}

impl RecordKind {
    pub fn classify(record_name: &[u8; 12], block_number: i32) -> RecordKind {
        match *record_name {
            SENTINEL_HEARTBEAT => RecordKind::Heartbeat,
            SENTINEL_REQUESTED => RecordKind::RepairPlaceholder,
            SENTINEL_FORCE_LOAD => RecordKind::ForceLoad,
            SENTINEL_CONTROL => RecordKind::Control,
            _ if block_number >= 0 => RecordKind::Data,
            _ => RecordKind::Index,
        }
    }
}

/// Fixed envelope carried ahead of every payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEnvelope {
    pub sequence: u32,
    pub julian_day: i32,
    pub source_node: [u8; 4],
    pub record_name: [u8; 12],
    pub block_number: i32,
    pub index_pointer: i32,
    pub extent_index: i32,
    pub continuation: bool,
}

/// One replicated unit: envelope, payload, and the kind decided at decode.
#[derive(Clone)]
pub struct Block {
    pub envelope: BlockEnvelope,
    pub payload: [u8; PAYLOAD_LEN],
    kind: RecordKind,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("envelope", &self.envelope)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Block {
    pub fn new(envelope: BlockEnvelope, payload: [u8; PAYLOAD_LEN]) -> Block {
        let kind = RecordKind::classify(&envelope.record_name, envelope.block_number);
        Block {
            envelope,
            payload,
            kind,
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Synthetic keepalive. Carries the cursor position so the subscriber can
    /// see where the stream stands, and an all-zero payload.
    pub fn heartbeat(sequence: u32, local_node: [u8; 4]) -> Block {
        Block::new(
            BlockEnvelope {
                sequence,
                julian_day: 0,
                source_node: local_node,
                record_name: SENTINEL_HEARTBEAT,
                block_number: -1,
                index_pointer: -1,
                extent_index: -1,
                continuation: false,
            },
            [0u8; PAYLOAD_LEN],
        )
    }

    /// Record name as a trimmed string for logging; lossy on purpose.
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.envelope.record_name)
            .trim_end()
            .to_string()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(FRAME_LEN);
        buf.put_u32(self.envelope.sequence);
        buf.put_i32(self.envelope.julian_day);
        buf.put_slice(&self.envelope.source_node);
        buf.put_slice(&self.envelope.record_name);
        buf.put_i32(self.envelope.block_number);
        buf.put_i32(self.envelope.index_pointer);
        buf.put_i32(self.envelope.extent_index);
        buf.put_u32(u32::from(self.envelope.continuation));
        buf.put_slice(&self.payload);
    }

    pub fn decode(frame: &[u8]) -> Result<Block> {
        if frame.len() != FRAME_LEN {
            return Err(ReplicationError::frame(format!(
                "frame length {}, want {FRAME_LEN}",
                frame.len()
            )));
        }
        let mut buf = frame;
        let sequence = buf.get_u32();
        if sequence == 0 || sequence > MAX_SEQUENCE {
            return Err(ReplicationError::frame(format!(
                "sequence {sequence} outside [1, {MAX_SEQUENCE}]"
            )));
        }
        let julian_day = buf.get_i32();
        let mut source_node = [0u8; 4];
        buf.copy_to_slice(&mut source_node);
        let mut record_name = [0u8; 12];
        buf.copy_to_slice(&mut record_name);
        if !record_name.iter().all(|b| (0x20..0x7f).contains(b)) {
            return Err(ReplicationError::frame("record name is not printable ASCII"));
        }
        let block_number = buf.get_i32();
        let index_pointer = buf.get_i32();
        let extent_index = buf.get_i32();
        let continuation = buf.get_u32() != 0;
        let mut payload = [0u8; PAYLOAD_LEN];
        buf.copy_to_slice(&mut payload);
        Ok(Block::new(
            BlockEnvelope {
                sequence,
                julian_day,
                source_node,
                record_name,
                block_number,
                index_pointer,
                extent_index,
                continuation,
            },
            payload,
        ))
    }
}

/// 22-byte subscriber handshake.
///
/// `requested_sequence <= 0` asks the server to choose a starting point based
/// on the playback flag and whether the queue has lapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub requested_sequence: i32,
    pub playback: bool,
    pub subscriber_tag: [u8; 10],
    pub node: [u8; 4],
}

impl Handshake {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_i32(self.requested_sequence);
        buf.put_i32(i32::from(self.playback));
        buf.put_slice(&self.subscriber_tag);
        buf.put_slice(&self.node);
    }

    pub fn decode(raw: &[u8]) -> Result<Handshake> {
        if raw.len() != HANDSHAKE_LEN {
            return Err(ReplicationError::Handshake(format!(
                "length {}, want {HANDSHAKE_LEN}",
                raw.len()
            )));
        }
        let mut buf = raw;
        let requested_sequence = buf.get_i32();
        if requested_sequence > MAX_SEQUENCE as i32 {
            return Err(ReplicationError::Handshake(format!(
                "requested sequence {requested_sequence} above {MAX_SEQUENCE}"
            )));
        }
        let playback = buf.get_i32() != 0;
        let mut subscriber_tag = [0u8; 10];
        buf.copy_to_slice(&mut subscriber_tag);
        let mut node = [0u8; 4];
        buf.copy_to_slice(&mut node);
        Ok(Handshake {
            requested_sequence,
            playback,
            subscriber_tag,
            node,
        })
    }

    pub fn tag_lossy(&self) -> String {
        String::from_utf8_lossy(&self.subscriber_tag)
            .trim_end()
            .to_string()
    }
}

/// 28-byte out-of-band repair request, magic `RQST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRequest {
    pub julian_day: i32,
    pub node: [u8; 4],
    pub start_block: i32,
    pub end_block: i32,
    pub index_pointer: i32,
    pub extent_index: i32,
}

impl RepairRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(REPAIR_REQUEST_LEN);
        buf.put_slice(&REPAIR_MAGIC);
        buf.put_i32(self.julian_day);
        buf.put_slice(&self.node);
        buf.put_i32(self.start_block);
        buf.put_i32(self.end_block);
        buf.put_i32(self.index_pointer);
        buf.put_i32(self.extent_index);
    }

    pub fn decode(raw: &[u8]) -> Result<RepairRequest> {
        if raw.len() != REPAIR_REQUEST_LEN {
            return Err(ReplicationError::frame(format!(
                "repair request length {}, want {REPAIR_REQUEST_LEN}",
                raw.len()
            )));
        }
        let mut buf = raw;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != REPAIR_MAGIC {
            return Err(ReplicationError::frame("repair request magic mismatch"));
        }
        let julian_day = buf.get_i32();
        let mut node = [0u8; 4];
        buf.copy_to_slice(&mut node);
        let start_block = buf.get_i32();
        let end_block = buf.get_i32();
        let index_pointer = buf.get_i32();
        let extent_index = buf.get_i32();
        if start_block < 0 || end_block < start_block {
            return Err(ReplicationError::frame(format!(
                "repair range [{start_block}, {end_block}] is not ascending"
            )));
        }
        Ok(RepairRequest {
            julian_day,
            node,
            start_block,
            end_block,
            index_pointer,
            extent_index,
        })
    }

    pub fn block_count(&self) -> usize {
        (self.end_block - self.start_block) as usize + 1
    }
}

/// Plausibility check used before serving a repaired range: a real data block
/// is never all zero and starts with the fixed record header (six digit
/// positions then a quality code).
pub fn looks_like_data_header(payload: &[u8; PAYLOAD_LEN]) -> bool {
    if payload.iter().all(|b| *b == 0) {
        return false;
    }
    payload[..6]
        .iter()
        .all(|b| b.is_ascii_digit() || *b == b' ')
        && matches!(payload[6], b'D' | b'R' | b'Q' | b'M')
}

/// Recover the 12-character channel name from a payload header, for blocks
/// delivered under the `REQUESTEDBLK` placeholder. Layout in the header:
/// station at 8 (5), location at 13 (2), channel at 15 (3), network at 18 (2);
/// composed as network + station + channel + location.
pub fn channel_from_payload(payload: &[u8; PAYLOAD_LEN]) -> Option<[u8; 12]> {
    let mut name = [0u8; 12];
    name[..2].copy_from_slice(&payload[18..20]);
    name[2..7].copy_from_slice(&payload[8..13]);
    name[7..10].copy_from_slice(&payload[15..18]);
    name[10..].copy_from_slice(&payload[13..15]);
    if name.iter().all(|b| (0x20..0x7f).contains(b)) {
        Some(name)
    } else {
        None
    }
}

/// Total serialized length a multi-block logical record declares for itself,
/// read from the fixed header (big-endian u16 at offset 30). `None` when the
/// value is zero, not a multiple of the block size, or spans more than one
/// extent allocation's worth of blocks.
pub fn declared_record_length(payload: &[u8; PAYLOAD_LEN]) -> Option<usize> {
    let len = u16::from_be_bytes([payload[30], payload[31]]) as usize;
    if len == 0 || len % PAYLOAD_LEN != 0 || len / PAYLOAD_LEN > 64 {
        None
    } else {
        Some(len)
    }
}

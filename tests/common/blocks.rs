//! Builders for blocks and payloads used across the integration tests.

use waverep::block::{Block, BlockEnvelope, Handshake, FRAME_LEN, HANDSHAKE_LEN, PAYLOAD_LEN};
use waverep::store::{today_julian, FileKey, IndexBlockRecord};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const CHANNEL: [u8; 12] = *b"IUANMO BHZ00";

/// Payload carrying a plausible fixed record header so it survives the
/// repair-path plausibility check, with `CHANNEL` recoverable from it.
pub fn record_payload(fill: u8, declared_len: u16) -> [u8; PAYLOAD_LEN] {
    let mut payload = [fill.max(1); PAYLOAD_LEN];
    payload[..8].copy_from_slice(b"000001D ");
    payload[8..13].copy_from_slice(b"ANMO ");
    payload[13..15].copy_from_slice(b"00");
    payload[15..18].copy_from_slice(b"BHZ");
    payload[18..20].copy_from_slice(b"IU");
    payload[30..32].copy_from_slice(&declared_len.to_be_bytes());
    payload
}

pub fn data_block(key: FileKey, block_number: i32, pointer: i32, fill: u8) -> Block {
    Block::new(
        BlockEnvelope {
            sequence: 0,
            julian_day: key.julian_day,
            source_node: key.node,
            record_name: CHANNEL,
            block_number,
            index_pointer: pointer,
            extent_index: 0,
            continuation: false,
        },
        record_payload(fill, 0),
    )
}

/// Frame shipping one index block of `record` at `pointer`.
pub fn index_frame(key: FileKey, pointer: i32, record: &IndexBlockRecord) -> Block {
    Block::new(
        BlockEnvelope {
            sequence: 0,
            julian_day: key.julian_day,
            source_node: key.node,
            record_name: record.channel,
            block_number: -1,
            index_pointer: pointer,
            extent_index: -1,
            continuation: false,
        },
        record.encode(),
    )
}

pub fn test_key(node: [u8; 4]) -> FileKey {
    FileKey {
        julian_day: today_julian(),
        node,
    }
}

/// Connect and complete the subscription handshake.
pub async fn subscribe(
    addr: std::net::SocketAddr,
    requested_sequence: i32,
    playback: bool,
) -> TcpStream {
    let mut socket = TcpStream::connect(addr).await.expect("connect endpoint");
    let hs = Handshake {
        requested_sequence,
        playback,
        subscriber_tag: *b"ITEST     ",
        node: *b"TST9",
    };
    let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
    hs.encode(&mut buf);
    socket.write_all(&buf).await.expect("send handshake");
    socket
}

/// Read exactly one frame off the stream.
pub async fn read_frame(socket: &mut TcpStream) -> Block {
    let mut raw = [0u8; FRAME_LEN];
    socket.read_exact(&mut raw).await.expect("read frame");
    Block::decode(&raw).expect("decode frame")
}

/// Encode a block the way the endpoint ships it.
#[allow(dead_code)]
pub fn encode_frame(block: &Block) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(FRAME_LEN);
    block.encode(&mut buf);
    buf.to_vec()
}

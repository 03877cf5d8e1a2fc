//! Fuzz target for the frame codec.
//!
//! `Block::decode` must never panic on arbitrary input, and every frame it
//! accepts must survive an encode/decode round trip unchanged.

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use waverep::block::{Block, FRAME_LEN};

fuzz_target!(|data: &[u8]| {
    let Ok(block) = Block::decode(data) else {
        return;
    };
    let mut buf = BytesMut::with_capacity(FRAME_LEN);
    block.encode(&mut buf);
    let back = Block::decode(&buf).expect("re-encoded frame must decode");
    assert_eq!(back.envelope, block.envelope);
    assert_eq!(back.payload, block.payload);
});

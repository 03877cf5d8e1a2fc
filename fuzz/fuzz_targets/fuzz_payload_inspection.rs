//! Fuzz target for the payload header heuristics.
//!
//! The inspection helpers run on every repair-path payload; none of them
//! may panic whatever the 512 bytes contain.

#![no_main]

use libfuzzer_sys::fuzz_target;
use waverep::block::{
    channel_from_payload, declared_record_length, looks_like_data_header, PAYLOAD_LEN,
};

fuzz_target!(|data: &[u8]| {
    if data.len() < PAYLOAD_LEN {
        return;
    }
    let mut payload = [0u8; PAYLOAD_LEN];
    payload.copy_from_slice(&data[..PAYLOAD_LEN]);

    let _ = looks_like_data_header(&payload);
    let _ = declared_record_length(&payload);
    if let Some(name) = channel_from_payload(&payload) {
        assert!(name.iter().all(|b| (0x20..0x7f).contains(b)));
    }
});

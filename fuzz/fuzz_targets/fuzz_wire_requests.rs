//! Fuzz target for the small fixed wire structures.
//!
//! Handshake and repair-request decoding must never panic on arbitrary
//! input; both arrive straight off untrusted subscriber sockets.

#![no_main]

use libfuzzer_sys::fuzz_target;
use waverep::block::{Handshake, RepairRequest};

fuzz_target!(|data: &[u8]| {
    let _ = Handshake::decode(data);
    let _ = RepairRequest::decode(data);
});

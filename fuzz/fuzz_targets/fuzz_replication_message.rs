//! Fuzz target for replication message parsing.
//!
//! Tests that the envelope decoder handles arbitrary input without panicking
//! and that anything it accepts survives a re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = hoard_protocol::ReplicationMessage::decode(data) {
        let encoded = message.encode().expect("decoded message must encode");
        let again = hoard_protocol::ReplicationMessage::decode(&encoded).expect("re-encoded message must decode");
        assert_eq!(again, message);
    }
});

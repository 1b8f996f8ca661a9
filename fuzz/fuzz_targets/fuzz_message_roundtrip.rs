//! Fuzz target for structured replication messages.

#![no_main]

use arbitrary::Arbitrary;
use hoard_protocol::ReplicationMessage;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Op {
    Store { key: String, size: i64 },
    Delete { key: String },
    Get { key: String },
}

#[derive(Debug, Arbitrary)]
struct Input {
    from: String,
    op: Op,
}

fuzz_target!(|input: Input| {
    let message = match input.op {
        // Negative sizes are rejected on decode, keep them out of the roundtrip.
        Op::Store { key, size } => ReplicationMessage::store_file(input.from, key, size.saturating_abs()),
        Op::Delete { key } => ReplicationMessage::delete_file(input.from, key),
        Op::Get { key } => ReplicationMessage::get_file(input.from, key),
    };

    // Oversized fields are refused by the encoder.
    if let Ok(encoded) = message.encode() {
        let decoded = ReplicationMessage::decode(&encoded).expect("encoded message must decode");
        assert_eq!(decoded, message);
    }
});

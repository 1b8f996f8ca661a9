//! Fuzz target for the connection frame decoder.
//!
//! Feeds arbitrary bytes to the framed decoder until it reports a fatal
//! error, the way a connection's decode loop would.

#![no_main]

use hoard_p2p::{Decoder, FramedDecoder, RawDecoder, MAX_FRAME_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(runtime) = tokio::runtime::Builder::new_current_thread().enable_time().build() else {
        return;
    };

    runtime.block_on(async {
        let framed = FramedDecoder::new();
        let mut reader = data;
        loop {
            match framed.decode(&mut reader).await {
                Ok(frame) => assert!(frame.payload.len() <= MAX_FRAME_SIZE),
                Err(e) if e.is_fatal() => break,
                Err(_) => {}
            }
        }

        let mut reader = data;
        while let Ok(frame) = RawDecoder.decode(&mut reader).await {
            assert!(!frame.payload.is_empty());
        }
    });
});

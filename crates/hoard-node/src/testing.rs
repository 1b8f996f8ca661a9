//! In-memory peers for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use hoard_p2p::{Frame, P2pError, Peer, Result};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;

/// Peer that records every write, or fails every write.
#[derive(Debug)]
pub(crate) struct RecordingPeer {
    id: u64,
    addr: String,
    fail: bool,
    sent: Mutex<Vec<Bytes>>,
}

impl RecordingPeer {
    pub(crate) fn new(id: u64, addr: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            addr: addr.to_string(),
            fail: false,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn failing(id: u64, addr: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            addr: addr.to_string(),
            fail: true,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Peer for RecordingPeer {
    fn id(&self) -> u64 {
        self.id
    }

    fn remote_addr(&self) -> String {
        self.addr.clone()
    }

    fn is_outbound(&self) -> bool {
        false
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        if self.fail {
            return Err(P2pError::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        self.sent.lock().push(Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn send_frames(&self, frames: &[Frame]) -> Result<()> {
        if self.fail {
            return Err(P2pError::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        let encoded = frames.iter().map(Frame::encode).collect::<Result<Vec<_>>>()?;
        self.sent.lock().extend(encoded);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

//! Node error types.

use hoard_p2p::P2pError;
use hoard_protocol::ProtocolError;
use hoard_storage::StorageError;
use thiserror::Error;

/// Errors raised by the replication coordinator.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Local storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The transport or a peer connection failed.
    #[error("transport error: {0}")]
    P2p(#[from] P2pError),

    /// A replication message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A message arrived from a connection that is not registered.
    #[error("peer ({0}) could not be found in the peer list")]
    PeerNotFound(String),

    /// File bytes arrived that no pending file can accept.
    #[error("unexpected stream data from {from}: {reason}")]
    UnexpectedStream {
        /// Connection the bytes arrived on.
        from: String,
        /// What was wrong with them.
        reason: String,
    },

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// A specialized Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while encoding or decoding replication messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The message is malformed.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A string field exceeds the encodable length.
    #[error("field too long: {size} bytes (max {max})")]
    FieldTooLong {
        /// The actual size.
        size: usize,
        /// The maximum allowed size.
        max: usize,
    },

    /// Unknown payload discriminant.
    #[error("unknown payload kind: {0}")]
    UnknownKind(u8),

    /// Incompatible protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(crate::Version),

    /// Invalid magic bytes.
    #[error("invalid magic bytes")]
    InvalidMagic,
}

/// A specialized Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

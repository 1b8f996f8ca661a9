//! # Hoard Protocol
//!
//! Replication protocol definitions for the Hoard P2P network.
//!
//! A [`ReplicationMessage`] is the control envelope one node sends another
//! to announce a store operation. For [`Payload::StoreFile`] the announced
//! number of raw payload bytes follows on the same connection.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod version;

pub use error::{ProtocolError, Result};
pub use messages::{Payload, PayloadKind, ReplicationMessage};
pub use version::{Version, PROTOCOL_VERSION};

/// Magic bytes identifying Hoard replication messages.
pub const MAGIC: [u8; 4] = *b"HRDP";

/// Maximum encoded length of a key or sender address.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

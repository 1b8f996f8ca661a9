//! # Hoard Node
//!
//! A node of a peer-to-peer, content-addressed file store.
//!
//! Each node keeps files in a local [`Store`](hoard_storage::Store) and
//! replicates every write and delete to the peers it is connected to.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  FileServer                  │
//! │  store_write / store_delete / store_read     │
//! ├───────────────┬──────────────────────────────┤
//! │ PeerRegistry  │  dispatch loop (one task)    │
//! ├───────────────┴──────────────────────────────┤
//! │          TcpTransport (hoard-p2p)            │
//! ├──────────────────────────────────────────────┤
//! │          Store (hoard-storage)               │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`server`] - Replication coordinator
//! - [`registry`] - Connected peers
//! - [`config`] - Node configuration
//! - [`observability`] - Logging setup

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod observability;
pub mod registry;
pub mod server;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{NodeError, Result};
pub use registry::{PeerEntry, PeerRegistry};
pub use server::{FileServer, FileServerOpts, DEFAULT_FETCH_TIMEOUT};

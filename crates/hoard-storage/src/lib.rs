//! Content-addressed file storage for Hoard.
//!
//! Keys are run through a [`PathTransform`] that derives a nested directory
//! layout and a file name. The canonical transform ([`cas_path_transform`])
//! hashes the key with SHA-1 and splits the hex digest into fixed-width
//! directory segments, which keeps directory fan-out uniform.
//!
//! ```text
//! root/
//! └── 0471c/0f32e/e0383/21c2b/50fbd/5e832/ede43/6c7ca/
//!     └── 0471c0f32ee038321c2b50fbd5e832ede436c7ca
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod path;
mod store;

pub use error::{Result, StorageError};
pub use path::{
    cas_path_transform, default_path_transform, PathKey, PathTransform, SEGMENT_WIDTH,
};
pub use store::{Store, StoreOpts, DEFAULT_ROOT};

//! Key to path transforms.

use sha1::{Digest, Sha1};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Width, in hex characters, of each directory segment produced by
/// [`cas_path_transform`].
pub const SEGMENT_WIDTH: usize = 5;

/// A pure function mapping a key to its on-disk layout.
pub type PathTransform = Arc<dyn Fn(&str) -> PathKey + Send + Sync>;

/// The on-disk location derived from a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathKey {
    /// Directory segments, outermost first.
    pub directory: Vec<String>,
    /// Name of the leaf file.
    pub file_name: String,
}

impl PathKey {
    /// Returns the directory segments joined with `/`.
    #[must_use]
    pub fn directory_name(&self) -> String {
        self.directory.join("/")
    }

    /// Returns the directory as a relative path.
    #[must_use]
    pub fn directory_path(&self) -> PathBuf {
        self.directory.iter().collect()
    }

    /// Returns the directory plus file name as a relative path.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        let mut path = self.directory_path();
        path.push(&self.file_name);
        path
    }

    /// Returns the outermost directory segment.
    ///
    /// Falls back to the file name when the key has no directory.
    #[must_use]
    pub fn first_segment(&self) -> &str {
        self.directory
            .first()
            .map_or(self.file_name.as_str(), String::as_str)
    }

    /// Returns the number of directory levels.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.directory.len()
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.directory.is_empty() {
            write!(f, "{}", self.file_name)
        } else {
            write!(f, "{}/{}", self.directory_name(), self.file_name)
        }
    }
}

/// Content-addressed transform: SHA-1 of the key, split into
/// [`SEGMENT_WIDTH`]-character directories.
///
/// # Example
///
/// ```
/// use hoard_storage::cas_path_transform;
///
/// let key = cas_path_transform("SpecialPictures");
/// assert_eq!(key.directory_name(), "0471c/0f32e/e0383/21c2b/50fbd/5e832/ede43/6c7ca");
/// assert_eq!(key.file_name, "0471c0f32ee038321c2b50fbd5e832ede436c7ca");
/// ```
#[must_use]
pub fn cas_path_transform(key: &str) -> PathKey {
    let digest = Sha1::digest(key.as_bytes());
    let file_name = hex::encode(digest);

    let depth = file_name.len() / SEGMENT_WIDTH;
    let directory = (0..depth)
        .map(|i| file_name[i * SEGMENT_WIDTH..(i + 1) * SEGMENT_WIDTH].to_string())
        .collect();

    PathKey {
        directory,
        file_name,
    }
}

/// Plain transform: every key lives under `default/` with its own name.
#[must_use]
pub fn default_path_transform(key: &str) -> PathKey {
    PathKey {
        directory: vec!["default".to_string()],
        file_name: key.to_string(),
    }
}

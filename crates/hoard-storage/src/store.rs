//! On-disk content-addressed store.

use crate::path::{default_path_transform, PathKey, PathTransform};
use crate::{Result, StorageError};
use bytes::Bytes;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Root folder used when none is configured.
pub const DEFAULT_ROOT: &str = "hoard-root";

/// Options for opening a [`Store`].
#[derive(Clone)]
pub struct StoreOpts {
    /// Folder containing every stored file.
    pub root: PathBuf,
    /// Maps keys to their on-disk layout.
    pub path_transform: Option<PathTransform>,
}

impl StoreOpts {
    /// Creates options for the given root and transform.
    pub fn new(root: impl Into<PathBuf>, path_transform: PathTransform) -> Self {
        Self {
            root: root.into(),
            path_transform: Some(path_transform),
        }
    }
}

impl std::fmt::Debug for StoreOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOpts")
            .field("root", &self.root)
            .field("path_transform", &self.path_transform.is_some())
            .finish()
    }
}

/// Content-addressed file store rooted at a single directory.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
    path_transform: PathTransform,
}

impl Store {
    /// Creates a store, filling in the default root and transform when unset.
    #[must_use]
    pub fn new(opts: StoreOpts) -> Self {
        let root = if opts.root.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_ROOT)
        } else {
            opts.root
        };
        let path_transform = opts
            .path_transform
            .unwrap_or_else(|| Arc::new(default_path_transform));

        Self {
            root,
            path_transform,
        }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the layout derived for `key`.
    #[must_use]
    pub fn path_key(&self, key: &str) -> PathKey {
        (self.path_transform)(key)
    }

    /// Returns the absolute location of the file for `key`.
    #[must_use]
    pub fn full_path(&self, key: &str) -> PathBuf {
        self.root.join(self.path_key(key).path())
    }

    /// Writes the whole reader to the file for `key`, replacing any previous
    /// content, and returns the number of bytes written.
    ///
    /// A failure while copying leaves a truncated file behind.
    pub fn write<R: Read + ?Sized>(&self, key: &str, reader: &mut R) -> Result<u64> {
        let path_key = self.path_key(key);

        let directory = self.root.join(path_key.directory_path());
        fs::create_dir_all(&directory)?;

        let path = directory.join(&path_key.file_name);
        let mut file = File::create(&path)?;
        let written = io::copy(reader, &mut file)?;

        debug!(key = %key, path = %path.display(), bytes = written, "Wrote file");
        Ok(written)
    }

    /// Reads the full contents stored under `key`.
    pub fn read(&self, key: &str) -> Result<Bytes> {
        let path = self.full_path(key);
        match fs::read(&path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns true if a file is stored under `key`.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        fs::metadata(self.full_path(key)).is_ok()
    }

    /// Removes the top-level directory segment of `key`.
    ///
    /// Every key sharing that first segment is removed with it.
    pub fn delete(&self, key: &str) -> Result<()> {
        let path_key = self.path_key(key);
        let bucket = self.root.join(path_key.first_segment());

        match fs::remove_dir_all(&bucket) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(key = %key, file = %path_key.file_name, "Removed from disk");
        Ok(())
    }

    /// Removes the whole root directory.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists every stored file relative to the root, sorted.
    pub fn stored_files(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry?;
            if entry.file_type().is_file() {
                if let Ok(relative) = entry.path().strip_prefix(&self.root) {
                    files.push(relative.to_path_buf());
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("root", &self.root).finish()
    }
}

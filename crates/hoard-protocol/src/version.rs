//! Protocol versioning.

use bytes::{Buf, BufMut};

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version {
    major: 0,
    minor: 1,
    patch: 0,
};

/// A semantic version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major version (breaking changes).
    pub major: u16,
    /// Minor version (new features).
    pub minor: u16,
    /// Patch version (bug fixes).
    pub patch: u16,
}

impl Version {
    /// Encoded length in bytes.
    pub const ENCODED_LEN: usize = 6;

    /// Creates a new version.
    #[must_use]
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Returns true if this version is compatible with another.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Writes the version as three big-endian `u16`s.
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.major);
        buf.put_u16(self.minor);
        buf.put_u16(self.patch);
    }

    /// Reads a version written by [`Version::put`].
    ///
    /// Returns `None` if fewer than [`Version::ENCODED_LEN`] bytes remain.
    pub fn get(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        Some(Self::new(buf.get_u16(), buf.get_u16(), buf.get_u16()))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

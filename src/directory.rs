//! Directory identity as handed over by the browsing layer.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Length (in hex chars) of a [`DirectoryKey`].
const KEY_LEN: usize = 32;

/// A browsable directory resolved by the caller.
///
/// The accessibility decision belongs to the access-control layer; the
/// archiver only honors it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryHandle {
    path: PathBuf,
    accessible: bool,
}

impl DirectoryHandle {
    /// Wrap an already canonical absolute path.
    pub fn new(path: impl Into<PathBuf>, accessible: bool) -> Self {
        Self {
            path: path.into(),
            accessible,
        }
    }

    /// Canonicalize `path` and wrap it.
    pub fn resolve(path: &Path, accessible: bool) -> Result<Self> {
        let path = std::fs::canonicalize(path)?;
        Ok(Self { path, accessible })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_accessible(&self) -> bool {
        self.accessible
    }

    /// Final path component, used to name the archive and its top-level folder.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "root".to_string())
    }

    pub fn key(&self) -> DirectoryKey {
        DirectoryKey::for_path(&self.path)
    }
}

/// Stable, filename-safe identity of a directory: a truncated SHA-256 of its
/// canonical path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectoryKey(String);

impl DirectoryKey {
    pub fn for_path(path: &Path) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self(digest[..KEY_LEN].to_string())
    }

    /// Parse a key read back from storage.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == KEY_LEN && raw.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(raw.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DirectoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_and_path_sensitive() {
        let a = DirectoryKey::for_path(Path::new("/srv/files/photos"));
        let b = DirectoryKey::for_path(Path::new("/srv/files/photos"));
        let c = DirectoryKey::for_path(Path::new("/srv/files/music"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), KEY_LEN);
        assert_eq!(DirectoryKey::parse(a.as_str()), Some(a));
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert!(DirectoryKey::parse("tmp").is_none());
        assert!(DirectoryKey::parse(&"z".repeat(KEY_LEN)).is_none());
    }

    #[test]
    fn name_falls_back_for_filesystem_root() {
        assert_eq!(DirectoryHandle::new("/", true).name(), "root");
        assert_eq!(DirectoryHandle::new("/srv/docs", true).name(), "docs");
    }
}

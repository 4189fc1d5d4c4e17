//! Content fingerprints for directories.
//!
//! A fingerprint is a SHA-256 over the sorted relative path, entry type, size
//! and modification time of every directory and regular file below the root.
//! It is a staleness signal, not a content hash: touching a file without
//! changing it still yields a new fingerprint.
//!
//! Regular files are opened once during the scan. A file that cannot be opened
//! is hashed as unreadable instead of by size and mtime, so gaining or losing
//! read access changes the fingerprint even though `chmod` leaves mtime alone.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::error::Result;

/// Lowercase hex SHA-256 summarizing a directory's content state.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Parse a fingerprint read back from storage.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == 64 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(raw.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Result of scanning a directory once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryScan {
    pub fingerprint: Fingerprint,
    /// Regular files that could be opened for reading.
    pub files: u64,
    pub directories: u64,
    pub total_bytes: u64,
    /// Entries that could not be read (permission denied, vanished),
    /// including regular files that exist but cannot be opened.
    pub unreadable: u64,
}

impl DirectoryScan {
    /// Directories and readable regular files below the root.
    pub fn entries(&self) -> u64 {
        self.files + self.directories
    }
}

/// Walk `root` and compute its fingerprint and entry statistics.
///
/// Symlinks are not followed and do not contribute, matching what the
/// archive builder packs. Unreadable entries are counted and mixed into the
/// hash by path so that a permission change is also a content change.
pub fn scan_directory(root: &Path) -> Result<DirectoryScan> {
    let root_meta = std::fs::metadata(root)?;
    if !root_meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", root.display()),
        )
        .into());
    }

    let mut hasher = Sha256::new();
    let mut files = 0u64;
    let mut directories = 0u64;
    let mut total_bytes = 0u64;
    let mut unreadable = 0u64;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1);

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let rel = err
                    .path()
                    .map(|p| relative_name(root, p))
                    .unwrap_or_default();
                tracing::debug!(
                    target = "dir_archiver",
                    root = %root.display(),
                    entry = %rel,
                    error = %err,
                    "skipping unreadable entry while fingerprinting"
                );
                hasher.update(b"!");
                hasher.update(rel.as_bytes());
                hasher.update([0u8]);
                unreadable += 1;
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }

        let rel = relative_name(root, entry.path());
        let md = match entry.metadata() {
            Ok(md) => md,
            Err(err) => {
                tracing::debug!(
                    target = "dir_archiver",
                    entry = %entry.path().display(),
                    error = %err,
                    "entry vanished while fingerprinting"
                );
                unreadable += 1;
                continue;
            }
        };

        if file_type.is_dir() {
            directories += 1;
            hasher.update(b"d");
            hasher.update(rel.as_bytes());
            hasher.update([0u8]);
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        // Same check the archive builder makes before packing a file.
        if let Err(err) = File::open(entry.path()) {
            tracing::debug!(
                target = "dir_archiver",
                entry = %entry.path().display(),
                error = %err,
                "file is not readable; fingerprinting as unreadable"
            );
            hasher.update(b"!f");
            hasher.update(rel.as_bytes());
            hasher.update([0u8]);
            unreadable += 1;
            continue;
        }

        files += 1;
        total_bytes += md.len();
        let modified_nanos: u128 = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        hasher.update(b"f");
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(md.len().to_le_bytes());
        hasher.update(modified_nanos.to_le_bytes());
    }

    Ok(DirectoryScan {
        fingerprint: Fingerprint(format!("{:x}", hasher.finalize())),
        files,
        directories,
        total_bytes,
        unreadable,
    })
}

/// Fingerprint only; see [`scan_directory`].
pub fn fingerprint_directory(root: &Path) -> Result<Fingerprint> {
    scan_directory(root).map(|scan| scan.fingerprint)
}

/// `/`-separated path of `path` relative to `root`.
pub(crate) fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("docs/nested")).unwrap();
        fs::write(tmp.path().join("readme.txt"), b"hello").unwrap();
        fs::write(tmp.path().join("docs/nested/a.txt"), b"abc").unwrap();
        tmp
    }

    #[test]
    fn scan_counts_entries() {
        let tmp = sample_tree();
        let scan = scan_directory(tmp.path()).unwrap();
        assert_eq!(scan.files, 2);
        assert_eq!(scan.directories, 2);
        assert_eq!(scan.total_bytes, 8);
        assert_eq!(scan.unreadable, 0);
        assert_eq!(scan.entries(), 4);
    }

    #[test]
    fn fingerprint_is_stable_without_changes() {
        let tmp = sample_tree();
        let a = fingerprint_directory(tmp.path()).unwrap();
        let b = fingerprint_directory(tmp.path()).unwrap();
        assert_eq!(a, b);
        assert_eq!(Fingerprint::parse(a.as_str()), Some(a));
    }

    #[test]
    fn adding_a_file_changes_fingerprint() {
        let tmp = sample_tree();
        let before = fingerprint_directory(tmp.path()).unwrap();
        fs::write(tmp.path().join("docs/new.txt"), b"new").unwrap();
        let after = fingerprint_directory(tmp.path()).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn touching_a_file_changes_fingerprint() {
        let tmp = sample_tree();
        let before = fingerprint_directory(tmp.path()).unwrap();

        let file = fs::File::options()
            .write(true)
            .open(tmp.path().join("readme.txt"))
            .unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(120))
            .unwrap();
        drop(file);

        let after = fingerprint_directory(tmp.path()).unwrap();
        assert_ne!(before, after);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_do_not_contribute() {
        let tmp = sample_tree();
        let before = scan_directory(tmp.path()).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("readme.txt"), tmp.path().join("link"))
            .unwrap();
        let after = scan_directory(tmp.path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn empty_directory_has_no_files() {
        let tmp = TempDir::new().unwrap();
        let scan = scan_directory(tmp.path()).unwrap();
        assert_eq!(scan.files, 0);
        assert_eq!(scan.entries(), 0);
    }

    /// Root reads everything regardless of mode bits.
    #[cfg(unix)]
    fn running_as_root() -> bool {
        // SAFETY: geteuid has no preconditions.
        unsafe { libc::geteuid() == 0 }
    }

    #[cfg(unix)]
    fn set_mode(path: &Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_files_are_not_counted() {
        if running_as_root() {
            return;
        }
        let tmp = sample_tree();
        let secret = tmp.path().join("readme.txt");
        set_mode(&secret, 0o000);

        let scan = scan_directory(tmp.path()).unwrap();
        set_mode(&secret, 0o644);
        assert_eq!(scan.files, 1);
        assert_eq!(scan.total_bytes, 3);
        assert_eq!(scan.unreadable, 1);
    }

    #[cfg(unix)]
    #[test]
    fn regaining_read_access_changes_fingerprint() {
        if running_as_root() {
            return;
        }
        let tmp = sample_tree();
        let secret = tmp.path().join("docs/nested/a.txt");
        let readable = fingerprint_directory(tmp.path()).unwrap();

        set_mode(&secret, 0o000);
        let locked = fingerprint_directory(tmp.path()).unwrap();
        set_mode(&secret, 0o644);
        let restored = fingerprint_directory(tmp.path()).unwrap();

        assert_ne!(readable, locked);
        assert_eq!(readable, restored);
    }

    #[test]
    fn scanning_a_file_fails() {
        let tmp = sample_tree();
        assert!(scan_directory(&tmp.path().join("readme.txt")).is_err());
    }
}

//! On-disk archive cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! archives/<dir_key>/<fingerprint>/<dir_name>.tar.zst   blob
//! archives/<dir_key>/<fingerprint>/record.json          index record
//! tmp/                                                  partial builds
//! locks/                                                see `crate::lock`
//! ```
//!
//! The record is written (atomically) only after the blob has been renamed
//! into place, so an artifact is visible to readers exactly when both exist.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::directory::{DirectoryHandle, DirectoryKey};
use crate::error::{ArchiveError, Result};
use crate::fingerprint::Fingerprint;
use crate::token::generate_token;

pub const ARCHIVES_SUBDIR: &str = "archives";
pub const TMP_SUBDIR: &str = "tmp";
pub const LOCKS_SUBDIR: &str = "locks";
pub const ARCHIVE_EXTENSION: &str = "tar.zst";

const RECORD_FILENAME: &str = "record.json";

/// Persisted description of a published archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub directory: PathBuf,
    pub key: DirectoryKey,
    pub fingerprint: Fingerprint,
    pub file_name: String,
    pub size_bytes: u64,
    pub created_at_unix: u64,
    /// Last time the artifact was handed out for download; 0 if never.
    #[serde(default)]
    pub last_served_unix: u64,
}

/// A published archive resolved from its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub record: ArtifactRecord,
    pub path: PathBuf,
}

impl Artifact {
    pub fn key(&self) -> &DirectoryKey {
        &self.record.key
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.record.fingerprint
    }

    /// Publication or last download hand-out, whichever is later.
    pub fn last_used_unix(&self) -> u64 {
        self.record.created_at_unix.max(self.record.last_served_unix)
    }

    /// Time since [`last_used_unix`](Self::last_used_unix); zero for records
    /// from the future.
    pub fn idle(&self, now_unix: u64) -> Duration {
        Duration::from_secs(now_unix.saturating_sub(self.last_used_unix()))
    }
}

/// Basic store statistics.
#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub root: PathBuf,
    pub artifacts: u64,
    pub bytes: u64,
}

/// Archive cache rooted at a configured directory.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    /// Open (and create if needed) the store at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let store = Self {
            root: root.to_path_buf(),
        };
        store.ensure_layout()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_layout(&self) -> Result<()> {
        for dir in [self.archives_dir(), self.tmp_dir(), self.locks_dir()] {
            fs::create_dir_all(&dir).map_err(ArchiveError::storage(&dir))?;
        }
        Ok(())
    }

    /// Root of published blobs; this is what gets served to browsers.
    pub fn archives_dir(&self) -> PathBuf {
        self.root.join(ARCHIVES_SUBDIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_SUBDIR)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join(LOCKS_SUBDIR)
    }

    fn key_dir(&self, key: &DirectoryKey) -> PathBuf {
        self.archives_dir().join(key.as_str())
    }

    fn artifact_dir(&self, key: &DirectoryKey, fingerprint: &Fingerprint) -> PathBuf {
        self.key_dir(key).join(fingerprint.as_str())
    }

    /// A fresh, private path under `tmp/` for a partial build.
    pub fn temp_path(&self, label: &str) -> PathBuf {
        self.tmp_dir()
            .join(format!("{}-{label}.partial", generate_token()))
    }

    /// The published artifact for `(key, fingerprint)`, if any.
    pub fn find(&self, key: &DirectoryKey, fingerprint: &Fingerprint) -> Result<Option<Artifact>> {
        let dir = self.artifact_dir(key, fingerprint);
        let Some(record) = read_record(&dir.join(RECORD_FILENAME))? else {
            return Ok(None);
        };
        let path = dir.join(&record.file_name);
        if !path.is_file() {
            tracing::debug!(
                target = "dir_archiver",
                path = %path.display(),
                "record without blob; treating artifact as absent"
            );
            return Ok(None);
        }
        Ok(Some(Artifact { record, path }))
    }

    /// Move a finished build from `temp` into its canonical location.
    ///
    /// If an artifact for the same fingerprint is already published, `temp`
    /// is discarded and the existing artifact returned.
    pub fn publish(
        &self,
        dir: &DirectoryHandle,
        fingerprint: &Fingerprint,
        temp: &Path,
    ) -> Result<Artifact> {
        let key = dir.key();
        if let Some(existing) = self.find(&key, fingerprint)? {
            let _ = fs::remove_file(temp);
            return Ok(existing);
        }

        let artifact_dir = self.artifact_dir(&key, fingerprint);
        fs::create_dir_all(&artifact_dir).map_err(ArchiveError::storage(&artifact_dir))?;

        let file_name = format!("{}.{ARCHIVE_EXTENSION}", sanitize_file_name(&dir.name()));
        let path = artifact_dir.join(&file_name);
        atomic_rename(temp, &path)?;

        let size_bytes = fs::metadata(&path)
            .map_err(ArchiveError::storage(&path))?
            .len();
        let record = ArtifactRecord {
            directory: dir.path().to_path_buf(),
            key,
            fingerprint: fingerprint.clone(),
            file_name,
            size_bytes,
            created_at_unix: now_unix(),
            last_served_unix: 0,
        };
        self.write_record(&artifact_dir, &record)?;

        Ok(Artifact { record, path })
    }

    /// Stamp `artifact` as served now.
    ///
    /// Returns `None` if the artifact is no longer published.
    pub fn mark_served(&self, artifact: &Artifact) -> Result<Option<Artifact>> {
        let Some(mut found) = self.find(artifact.key(), artifact.fingerprint())? else {
            return Ok(None);
        };
        found.record.last_served_unix = now_unix();
        let artifact_dir = self.artifact_dir(found.key(), found.fingerprint());
        self.write_record(&artifact_dir, &found.record)?;
        Ok(Some(found))
    }

    /// Remove an artifact. Missing files count as already removed.
    ///
    /// The record goes first so readers stop seeing the artifact before its
    /// blob disappears.
    pub fn delete(&self, artifact: &Artifact) -> Result<()> {
        let dir = self.artifact_dir(artifact.key(), artifact.fingerprint());
        remove_file_if_exists(&dir.join(RECORD_FILENAME))?;
        remove_file_if_exists(&artifact.path)?;
        // Both may legitimately be non-empty or gone already.
        let _ = fs::remove_dir(&dir);
        let _ = fs::remove_dir(self.key_dir(artifact.key()));
        Ok(())
    }

    /// All published artifacts, optionally restricted to one directory,
    /// newest first.
    pub fn list_all(&self, key: Option<&DirectoryKey>) -> Result<Vec<Artifact>> {
        let (walk_root, depth) = match key {
            Some(key) => (self.key_dir(key), 2),
            None => (self.archives_dir(), 3),
        };
        if !walk_root.is_dir() {
            return Ok(vec![]);
        }

        let mut out = vec![];
        for ent in WalkDir::new(&walk_root)
            .min_depth(depth)
            .max_depth(depth)
            .into_iter()
            .filter_map(|ent| ent.ok())
        {
            if !ent.file_type().is_file() || ent.file_name() != RECORD_FILENAME {
                continue;
            }
            let record = match read_record(ent.path()) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(
                        target = "dir_archiver",
                        path = %ent.path().display(),
                        error = %err,
                        "skipping unreadable archive record"
                    );
                    continue;
                }
            };
            let Some(dir) = ent.path().parent() else {
                continue;
            };
            if !is_artifact_dir(dir, Some(&record)) {
                tracing::warn!(
                    target = "dir_archiver",
                    path = %ent.path().display(),
                    "skipping archive record stored under a foreign directory name"
                );
                continue;
            }
            let path = dir.join(&record.file_name);
            out.push(Artifact { record, path });
        }

        out.sort_by(|a, b| b.record.created_at_unix.cmp(&a.record.created_at_unix));
        Ok(out)
    }

    /// Remove leftovers of crashed builds older than `max_age`: partial files
    /// under `tmp/` and artifact directories that never got a record.
    ///
    /// Returns the number of removed entries.
    pub fn sweep_orphans(&self, max_age: Duration) -> Result<usize> {
        let mut removed = 0usize;

        let tmp_dir = self.tmp_dir();
        for ent in fs::read_dir(&tmp_dir).map_err(ArchiveError::storage(&tmp_dir))? {
            let Ok(ent) = ent else { continue };
            let path = ent.path();
            if !is_older_than(&path, max_age) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => tracing::warn!(
                    target = "dir_archiver",
                    path = %path.display(),
                    error = %err,
                    "failed to remove stale partial archive"
                ),
            }
        }

        for ent in WalkDir::new(self.archives_dir())
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|ent| ent.ok())
        {
            let path = ent.path();
            if !ent.file_type().is_dir()
                || !is_artifact_dir(path, None)
                || path.join(RECORD_FILENAME).exists()
            {
                continue;
            }
            if !is_older_than(path, max_age) {
                continue;
            }
            match fs::remove_dir_all(path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => tracing::warn!(
                    target = "dir_archiver",
                    path = %path.display(),
                    error = %err,
                    "failed to remove orphaned artifact directory"
                ),
            }
        }

        Ok(removed)
    }

    /// Return basic store statistics.
    pub fn status(&self) -> Result<StoreStatus> {
        let artifacts = self.list_all(None)?;
        Ok(StoreStatus {
            root: self.root.clone(),
            artifacts: artifacts.len() as u64,
            bytes: artifacts.iter().map(|a| a.record.size_bytes).sum(),
        })
    }

    fn write_record(&self, artifact_dir: &Path, record: &ArtifactRecord) -> Result<()> {
        let path = artifact_dir.join(RECORD_FILENAME);
        let bytes = serde_json::to_vec_pretty(record).map_err(|err| {
            ArchiveError::storage(&path)(io::Error::new(io::ErrorKind::InvalidData, err))
        })?;
        let tmp = self.temp_path("record");
        fs::write(&tmp, bytes).map_err(ArchiveError::storage(&tmp))?;
        atomic_rename(&tmp, &path)
    }
}

fn read_record(path: &Path) -> Result<Option<ArtifactRecord>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(ArchiveError::storage(path)(err)),
    };
    let record = serde_json::from_slice(&bytes).map_err(|err| {
        ArchiveError::storage(path)(io::Error::new(io::ErrorKind::InvalidData, err))
    })?;
    Ok(Some(record))
}

/// Whether `dir` is named `<dir_key>/<fingerprint>` (and, given a record,
/// the names match it).
fn is_artifact_dir(dir: &Path, record: Option<&ArtifactRecord>) -> bool {
    let name = |p: Option<&Path>| {
        p.and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(str::to_owned)
    };
    let fingerprint = name(Some(dir)).and_then(|n| Fingerprint::parse(&n));
    let key = name(dir.parent()).and_then(|n| DirectoryKey::parse(&n));
    match (key, fingerprint, record) {
        (Some(key), Some(fingerprint), Some(record)) => {
            key == record.key && fingerprint == record.fingerprint
        }
        (Some(_), Some(_), None) => true,
        _ => false,
    }
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ArchiveError::storage(path)(err)),
    }
}

fn is_older_than(path: &Path, max_age: Duration) -> bool {
    fs::symlink_metadata(path)
        .and_then(|md| md.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age >= max_age)
}

/// Keep archive names portable across download clients.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "archive".to_string()
    } else {
        trimmed.to_string()
    }
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn atomic_rename(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(ArchiveError::storage(parent))?;
    }
    // Prefer rename; within the store it's the same filesystem.
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_e) => {
            // Fall back to copy+rename through a sibling (e.g. EXDEV) so the
            // destination never holds a partial file.
            let staged = dst.with_extension("staged");
            fs::copy(src, &staged).map_err(ArchiveError::storage(&staged))?;
            fs::rename(&staged, dst).map_err(ArchiveError::storage(dst))?;
            fs::remove_file(src).map_err(ArchiveError::storage(src))?;
            Ok(())
        }
    }
}

//! The request-layer side of the archiver: resolve a directory to a URL a
//! browser can download its archive from.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::archiver::Archiver;
use crate::directory::DirectoryHandle;
use crate::error::{ArchiveError, Result};
use crate::path::normalize_file;

/// Maps an artifact's storage path to an externally reachable URL.
pub trait UrlGenerator {
    fn browser_url(&self, storage_path: &Path) -> Result<String>;
}

/// Serves everything below `storage_root` under `base_url`.
#[derive(Debug, Clone)]
pub struct BaseUrlGenerator {
    storage_root: PathBuf,
    base_url: String,
}

impl BaseUrlGenerator {
    pub fn new(storage_root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            storage_root: storage_root.into(),
            base_url: base_url.into(),
        }
    }

    /// Map the archiver's published archives onto its configured base URL.
    pub fn for_archiver(archiver: &Archiver) -> Self {
        Self::new(
            archiver.store().archives_dir(),
            archiver.config().base_url.clone(),
        )
    }
}

impl UrlGenerator for BaseUrlGenerator {
    fn browser_url(&self, storage_path: &Path) -> Result<String> {
        let outside = || ArchiveError::PathOutsideRoot {
            path: storage_path.to_path_buf(),
            root: self.storage_root.clone(),
        };
        let rel = storage_path
            .strip_prefix(&self.storage_root)
            .map_err(|_| outside())?;

        let mut segments = vec![];
        for component in rel.components() {
            match component {
                Component::Normal(segment) => {
                    segments.push(percent_encode_segment(&segment.to_string_lossy()))
                }
                Component::CurDir => {}
                _ => return Err(outside()),
            }
        }
        if segments.is_empty() {
            return Err(outside());
        }

        Ok(normalize_file(&format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            segments.join("/")
        )))
    }
}

/// Response body of a successful preparation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedDownload {
    #[serde(rename = "archiveUrl")]
    pub archive_url: String,
}

/// Make sure a current archive of `dir` exists and return its URL.
///
/// Obsolete archives of `dir` are removed first; failures there are logged
/// and do not block the download. A reused archive is stamped as served, so
/// the retention period restarts for the URL handed out. If another party is
/// already building, this waits for it (bounded by the configured wait
/// timeout).
pub fn prepare_download<U>(
    archiver: &Archiver,
    dir: &DirectoryHandle,
    urls: &U,
) -> Result<PreparedDownload>
where
    U: UrlGenerator + ?Sized,
{
    if let Err(err) = archiver.delete_obsolete_versions(dir) {
        tracing::warn!(
            target = "dir_archiver",
            directory = %dir.path().display(),
            error = %err,
            "failed to delete obsolete archives"
        );
    }

    archiver.check_archivable(dir)?;

    let artifact = match archiver.serve_archive(dir)? {
        Some(artifact) => artifact,
        None if !archiver.is_archiving(dir)? => match archiver.create_archive(dir) {
            Err(ArchiveError::AlreadyLocked { .. }) => archiver.wait_for_creation(dir)?,
            other => other?,
        },
        None => archiver.wait_for_creation(dir)?,
    };

    Ok(PreparedDownload {
        archive_url: urls.browser_url(&artifact.path)?,
    })
}

/// Percent-encode one path segment, keeping RFC 3986 `pchar`s.
fn percent_encode_segment(segment: &str) -> String {
    fn is_pchar(b: u8) -> bool {
        b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'-' | b'.'
                    | b'_'
                    | b'~'
                    | b'!'
                    | b'$'
                    | b'&'
                    | b'\''
                    | b'('
                    | b')'
                    | b'*'
                    | b','
                    | b';'
                    | b'='
                    | b':'
                    | b'@'
            )
    }

    const HEX: &[u8; 16] = b"0123456789ABCDEF";

    let mut out = String::with_capacity(segment.len());
    for &b in segment.as_bytes() {
        if is_pchar(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        }
    }
    out
}

//! Streams a directory into a `tar.zst` archive.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Instant, UNIX_EPOCH};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

use crate::directory::DirectoryHandle;
use crate::error::{ArchiveError, Result};
use crate::fingerprint::relative_name;

/// Why an entry was left out of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Symlink,
    PermissionDenied,
    Vanished,
    /// Sockets, FIFOs, device nodes.
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub path: String,
    pub reason: SkipReason,
}

/// A finished build still sitting at its private temporary path.
#[derive(Debug)]
pub struct BuiltArchive {
    pub temp_path: PathBuf,
    /// Archive member names, in archive order.
    pub entries: Vec<String>,
    pub skipped: Vec<SkippedEntry>,
}

#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    tmp_dir: PathBuf,
    compression_level: i32,
}

impl ArchiveBuilder {
    pub fn new(tmp_dir: impl Into<PathBuf>, compression_level: i32) -> Self {
        Self {
            tmp_dir: tmp_dir.into(),
            compression_level,
        }
    }

    /// Archive every accessible entry below `dir` into a fresh file under the
    /// builder's temp directory.
    ///
    /// On failure the temporary file is removed and
    /// [`ArchiveError::BuildFailed`] returned; nothing is left behind.
    pub fn build(&self, dir: &DirectoryHandle) -> Result<BuiltArchive> {
        let temp_path = self.tmp_dir.join(format!(
            "{}-{}.tar.zst.partial",
            crate::token::generate_token(),
            dir.key()
        ));
        let started = Instant::now();

        match write_tar_zst(dir.path(), &dir.name(), &temp_path, self.compression_level) {
            Ok((entries, skipped)) => {
                tracing::debug!(
                    target = "dir_archiver",
                    directory = %dir.path().display(),
                    entries = entries.len(),
                    skipped = skipped.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "archive stream finished"
                );
                Ok(BuiltArchive {
                    temp_path,
                    entries,
                    skipped,
                })
            }
            Err(source) => {
                let _ = fs::remove_file(&temp_path);
                Err(ArchiveError::BuildFailed {
                    directory: dir.path().to_path_buf(),
                    source,
                })
            }
        }
    }
}

fn write_tar_zst(
    src_dir: &Path,
    prefix: &str,
    out_path: &Path,
    level: i32,
) -> io::Result<(Vec<String>, Vec<SkippedEntry>)> {
    let out = File::create(out_path)?;
    let encoder = zstd::stream::Encoder::new(out, level)?;
    let mut builder = TarBuilder::new(encoder);
    let mut entries = vec![];
    let mut skipped = vec![];

    let root_md = fs::metadata(src_dir)?;
    append_dir(&mut builder, prefix, &root_md)?;
    entries.push(prefix.to_string());

    for ent in WalkDir::new(src_dir)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
    {
        let ent = match ent {
            Ok(ent) => ent,
            Err(err) => {
                let rel = err
                    .path()
                    .map(|p| relative_name(src_dir, p))
                    .unwrap_or_default();
                let io_err = io::Error::from(err);
                match skip_reason(&io_err) {
                    Some(reason) => {
                        record_skip(&mut skipped, src_dir, rel, reason, Some(&io_err));
                        continue;
                    }
                    None => return Err(io_err),
                }
            }
        };

        let rel = relative_name(src_dir, ent.path());
        let name = format!("{prefix}/{rel}");
        let file_type = ent.file_type();

        if file_type.is_symlink() {
            record_skip(&mut skipped, src_dir, rel, SkipReason::Symlink, None);
            continue;
        }

        if file_type.is_dir() {
            let md = match ent.metadata() {
                Ok(md) => md,
                Err(err) => {
                    let io_err = io::Error::from(err);
                    match skip_reason(&io_err) {
                        Some(reason) => {
                            record_skip(&mut skipped, src_dir, rel, reason, Some(&io_err));
                            continue;
                        }
                        None => return Err(io_err),
                    }
                }
            };
            append_dir(&mut builder, &name, &md)?;
            entries.push(name);
            continue;
        }

        if !file_type.is_file() {
            record_skip(&mut skipped, src_dir, rel, SkipReason::Unsupported, None);
            continue;
        }

        let file = match File::open(ent.path()) {
            Ok(file) => file,
            Err(err) => match skip_reason(&err) {
                Some(reason) => {
                    record_skip(&mut skipped, src_dir, rel, reason, Some(&err));
                    continue;
                }
                None => return Err(err),
            },
        };
        // Size and mtime from the open handle, so they describe what we read.
        let md = file.metadata()?;
        let size = md.len();
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(size);
        fill_common(&mut header, &md, 0o644);
        header.set_cksum();
        // A file that shrinks mid-read is zero-padded to the header size;
        // the fingerprint check on the next request marks it obsolete.
        let data = file.take(size).chain(io::repeat(0)).take(size);
        builder.append_data(&mut header, &name, data)?;
        entries.push(name);
    }

    let encoder = builder.into_inner()?;
    let file = encoder.finish()?;
    file.sync_all()?;
    Ok((entries, skipped))
}

fn append_dir<W: io::Write>(
    builder: &mut TarBuilder<W>,
    name: &str,
    md: &fs::Metadata,
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    fill_common(&mut header, md, 0o755);
    header.set_cksum();
    builder.append_data(&mut header, name, io::empty())
}

fn fill_common(header: &mut tar::Header, md: &fs::Metadata, _default_mode: u32) {
    let mtime = md
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    header.set_mtime(mtime);
    header.set_uid(0);
    header.set_gid(0);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        header.set_mode(md.permissions().mode() & 0o7777);
    }
    #[cfg(not(unix))]
    {
        header.set_mode(_default_mode);
    }
}

fn skip_reason(err: &io::Error) -> Option<SkipReason> {
    match err.kind() {
        io::ErrorKind::PermissionDenied => Some(SkipReason::PermissionDenied),
        io::ErrorKind::NotFound => Some(SkipReason::Vanished),
        _ => None,
    }
}

fn record_skip(
    skipped: &mut Vec<SkippedEntry>,
    src_dir: &Path,
    path: String,
    reason: SkipReason,
    err: Option<&io::Error>,
) {
    tracing::warn!(
        target = "dir_archiver",
        directory = %src_dir.display(),
        entry = %path,
        reason = ?reason,
        error = err.map(|e| e.to_string()),
        "skipping entry while archiving"
    );
    skipped.push(SkippedEntry { path, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_members(path: &Path) -> Vec<(String, Vec<u8>)> {
        let file = File::open(path).unwrap();
        let decoder = zstd::stream::Decoder::new(file).unwrap();
        let mut archive = tar::Archive::new(decoder);
        let mut out = vec![];
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry
                .path()
                .unwrap()
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string();
            let mut bytes = vec![];
            entry.read_to_end(&mut bytes).unwrap();
            out.push((name, bytes));
        }
        out
    }

    fn source_tree(tmp: &TempDir) -> DirectoryHandle {
        let src = tmp.path().join("music");
        fs::create_dir_all(src.join("album")).unwrap();
        fs::write(src.join("album/track.flac"), b"flac").unwrap();
        fs::write(src.join("cover.png"), b"png").unwrap();
        DirectoryHandle::resolve(&src, true).unwrap()
    }

    #[test]
    fn build_packs_tree_under_directory_name() {
        let tmp = TempDir::new().unwrap();
        let dir = source_tree(&tmp);
        let builder = ArchiveBuilder::new(tmp.path().join("tmp"), 3);
        fs::create_dir_all(tmp.path().join("tmp")).unwrap();

        let built = builder.build(&dir).unwrap();
        assert!(built.skipped.is_empty());
        assert_eq!(
            built.entries,
            vec!["music", "music/album", "music/album/track.flac", "music/cover.png"]
        );

        let members = read_members(&built.temp_path);
        let names: Vec<&str> = members.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["music", "music/album", "music/album/track.flac", "music/cover.png"]
        );
        let track = members
            .iter()
            .find(|(n, _)| n == "music/album/track.flac")
            .unwrap();
        assert_eq!(track.1, b"flac");
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_skipped_with_reason() {
        let tmp = TempDir::new().unwrap();
        let dir = source_tree(&tmp);
        std::os::unix::fs::symlink("/etc/passwd", dir.path().join("passwd")).unwrap();
        let builder = ArchiveBuilder::new(tmp.path().join("tmp"), 3);
        fs::create_dir_all(tmp.path().join("tmp")).unwrap();

        let built = builder.build(&dir).unwrap();
        assert_eq!(
            built.skipped,
            vec![SkippedEntry {
                path: "passwd".to_string(),
                reason: SkipReason::Symlink,
            }]
        );
        assert!(!built.entries.iter().any(|e| e.ends_with("passwd")));
    }

    #[test]
    fn failed_build_leaves_no_temp_file() {
        let tmp = TempDir::new().unwrap();
        let dir = DirectoryHandle::new(tmp.path().join("missing"), true);
        let tmp_dir = tmp.path().join("tmp");
        fs::create_dir_all(&tmp_dir).unwrap();
        let builder = ArchiveBuilder::new(&tmp_dir, 3);

        let err = builder.build(&dir).unwrap_err();
        assert!(matches!(err, ArchiveError::BuildFailed { .. }));
        assert_eq!(fs::read_dir(&tmp_dir).unwrap().count(), 0);
    }
}

//! Cross-process build locks keyed by directory identity.
//!
//! Each lock is a JSON record `<locks>/<key>.lock.json` naming its holder and
//! an expiry deadline. Records are only read-modified-written while holding an
//! `fs2` exclusive lock on the sibling `<key>.guard` file, so acquisition,
//! release and reclamation are serialized between threads and processes that
//! share the cache directory. The guard is held for a few syscalls, never for
//! the duration of a build.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::MIN_POLL_INTERVAL;
use crate::directory::DirectoryKey;
use crate::error::{ArchiveError, Result};
use crate::token::generate_token;

const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A live or abandoned lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub key: DirectoryKey,
    pub holder: String,
    pub pid: u32,
    pub host: String,
    pub acquired_at_unix_ms: u64,
    pub expires_at_unix_ms: u64,
}

impl LockEntry {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_unix_ms
    }

    /// Expired, or held by a process on this host that no longer exists.
    fn is_abandoned(&self, now_ms: u64, host: &str) -> bool {
        self.is_expired(now_ms) || (self.host == host && !process_alive(self.pid))
    }
}

/// Named mutexes for archive builds.
#[derive(Debug, Clone)]
pub struct BuildLocks {
    dir: PathBuf,
    max_build: Duration,
    poll_interval: Duration,
    host: String,
}

impl BuildLocks {
    /// Lock records live in `dir`; a record older than `max_build` is
    /// considered abandoned.
    pub fn new(
        dir: impl Into<PathBuf>,
        max_build: Duration,
        poll_interval: Duration,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(ArchiveError::storage(&dir))?;
        Ok(Self {
            dir,
            max_build,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            host: host_name(),
        })
    }

    fn record_path(&self, key: &DirectoryKey) -> PathBuf {
        self.dir.join(format!("{key}.lock.json"))
    }

    fn guard_path(&self, key: &DirectoryKey) -> PathBuf {
        self.dir.join(format!("{key}.guard"))
    }

    /// Try to take the lock for `key` without waiting.
    ///
    /// Fails with [`ArchiveError::AlreadyLocked`] if a live record exists.
    /// Abandoned records are reclaimed.
    pub fn acquire(&self, key: &DirectoryKey) -> Result<LockGuard> {
        self.with_guard(key, || {
            if let Some(existing) = self.live_entry_reclaiming(key)? {
                return Err(ArchiveError::AlreadyLocked {
                    key: key.to_string(),
                    holder: format!("{}@{}:{}", existing.holder, existing.host, existing.pid),
                });
            }

            let now = now_millis();
            let entry = LockEntry {
                key: key.clone(),
                holder: generate_token(),
                pid: std::process::id(),
                host: self.host.clone(),
                acquired_at_unix_ms: now,
                expires_at_unix_ms: now.saturating_add(duration_millis(self.max_build)),
            };
            self.write_entry(&entry)?;
            tracing::debug!(
                target = "dir_archiver",
                key = %key,
                holder = %entry.holder,
                "acquired build lock"
            );
            Ok(LockGuard {
                locks: self.clone(),
                entry,
                released: false,
            })
        })
    }

    /// Remove the record for `key` if it is still held by `token`.
    ///
    /// Releasing an already released or reclaimed lock is a no-op.
    pub fn release(&self, key: &DirectoryKey, token: &str) -> Result<()> {
        self.with_guard(key, || {
            match self.read_entry(key)? {
                Some(entry) if entry.holder == token => {
                    self.remove_entry(key)?;
                    tracing::debug!(
                        target = "dir_archiver",
                        key = %key,
                        holder = token,
                        "released build lock"
                    );
                }
                Some(entry) => {
                    tracing::debug!(
                        target = "dir_archiver",
                        key = %key,
                        holder = token,
                        current = %entry.holder,
                        "lock was reclaimed by another holder; nothing to release"
                    );
                }
                None => {}
            }
            Ok(())
        })
    }

    /// The live record for `key`, if any. Does not reclaim.
    pub fn status(&self, key: &DirectoryKey) -> Result<Option<LockEntry>> {
        let now = now_millis();
        Ok(self
            .read_entry(key)?
            .filter(|entry| !entry.is_abandoned(now, &self.host)))
    }

    /// Block until no live record exists for `key`, reclaiming abandoned ones.
    ///
    /// Polls with exponential backoff starting at the configured interval.
    pub fn wait_for(&self, key: &DirectoryKey, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut delay = self.poll_interval;

        loop {
            let held = self.with_guard(key, || self.live_entry_reclaiming(key))?;
            if held.is_none() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ArchiveError::LockTimeout {
                    key: key.to_string(),
                    waited: started.elapsed(),
                });
            }
            std::thread::sleep(delay.min(deadline - now));
            delay = (delay * 2).min(MAX_POLL_INTERVAL);
        }
    }

    /// Must be called with the guard held.
    fn live_entry_reclaiming(&self, key: &DirectoryKey) -> Result<Option<LockEntry>> {
        let Some(entry) = self.read_entry(key)? else {
            return Ok(None);
        };
        let now = now_millis();
        if !entry.is_abandoned(now, &self.host) {
            return Ok(Some(entry));
        }
        tracing::warn!(
            target = "dir_archiver",
            key = %key,
            holder = %entry.holder,
            pid = entry.pid,
            host = %entry.host,
            age_ms = now.saturating_sub(entry.acquired_at_unix_ms),
            "reclaiming abandoned build lock"
        );
        self.remove_entry(key)?;
        Ok(None)
    }

    fn with_guard<T>(&self, key: &DirectoryKey, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let guard_path = self.guard_path(key);
        // Guard files are never unlinked: removing a locked file would let a
        // second process lock a fresh inode at the same path.
        let guard = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&guard_path)
            .map_err(ArchiveError::storage(&guard_path))?;
        guard
            .lock_exclusive()
            .map_err(ArchiveError::storage(&guard_path))?;
        let result = f();
        let _ = guard.unlock();
        result
    }

    fn read_entry(&self, key: &DirectoryKey) -> Result<Option<LockEntry>> {
        let path = self.record_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(ArchiveError::storage(&path)(err)),
        };
        match serde_json::from_slice::<LockEntry>(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                // Records are written by rename, so this is foreign or corrupt;
                // the next acquire overwrites it.
                tracing::warn!(
                    target = "dir_archiver",
                    path = %path.display(),
                    error = %err,
                    "ignoring unparsable lock record"
                );
                Ok(None)
            }
        }
    }

    fn write_entry(&self, entry: &LockEntry) -> Result<()> {
        let path = self.record_path(&entry.key);
        let tmp = self.dir.join(format!("{}.{}.tmp", entry.key, entry.holder));
        let bytes = serde_json::to_vec_pretty(entry).map_err(|err| {
            ArchiveError::storage(&tmp)(io::Error::new(io::ErrorKind::InvalidData, err))
        })?;
        fs::write(&tmp, bytes).map_err(ArchiveError::storage(&tmp))?;
        fs::rename(&tmp, &path).map_err(|err| {
            let _ = fs::remove_file(&tmp);
            ArchiveError::storage(&path)(err)
        })
    }

    fn remove_entry(&self, key: &DirectoryKey) -> Result<()> {
        let path = self.record_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ArchiveError::storage(&path)(err)),
        }
    }
}

/// RAII guard: releases the build lock on drop.
#[derive(Debug)]
pub struct LockGuard {
    locks: BuildLocks,
    entry: LockEntry,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &DirectoryKey {
        &self.entry.key
    }

    pub fn token(&self) -> &str {
        &self.entry.holder
    }

    /// Release now, surfacing I/O errors that `Drop` would swallow.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.locks.release(&self.entry.key, &self.entry.holder)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.locks.release(&self.entry.key, &self.entry.holder) {
            tracing::warn!(
                target = "dir_archiver",
                key = %self.entry.key,
                error = %err,
                "failed to release build lock"
            );
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(unix)]
fn host_name() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes and gethostname
    // writes at most that many.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(not(unix))]
fn host_name() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return true;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn locks(tmp: &TempDir, max_build: Duration) -> BuildLocks {
        BuildLocks::new(tmp.path().join("locks"), max_build, Duration::from_millis(10)).unwrap()
    }

    fn key() -> DirectoryKey {
        DirectoryKey::for_path(Path::new("/srv/files/photos"))
    }

    #[test]
    fn second_acquire_fails_until_release() {
        let tmp = TempDir::new().unwrap();
        let locks = locks(&tmp, Duration::from_secs(60));

        let guard = locks.acquire(&key()).unwrap();
        let err = locks.acquire(&key()).unwrap_err();
        assert!(matches!(err, ArchiveError::AlreadyLocked { .. }));
        assert_eq!(
            locks.status(&key()).unwrap().map(|e| e.holder),
            Some(guard.token().to_string())
        );

        guard.release().unwrap();
        assert!(locks.status(&key()).unwrap().is_none());
        locks.acquire(&key()).unwrap();
    }

    #[test]
    fn release_is_idempotent_and_token_checked() {
        let tmp = TempDir::new().unwrap();
        let locks = locks(&tmp, Duration::from_secs(60));

        let guard = locks.acquire(&key()).unwrap();
        locks.release(&key(), "someone-else").unwrap();
        assert!(locks.status(&key()).unwrap().is_some());

        let token = guard.token().to_string();
        locks.release(&key(), &token).unwrap();
        locks.release(&key(), &token).unwrap();
        assert!(locks.status(&key()).unwrap().is_none());
        drop(guard);
    }

    #[test]
    fn dropping_guard_releases() {
        let tmp = TempDir::new().unwrap();
        let locks = locks(&tmp, Duration::from_secs(60));
        {
            let _guard = locks.acquire(&key()).unwrap();
        }
        assert!(locks.status(&key()).unwrap().is_none());
    }

    #[test]
    fn expired_lock_is_reclaimed_by_acquire() {
        let tmp = TempDir::new().unwrap();
        let locks = locks(&tmp, Duration::from_millis(20));

        let stale = locks.acquire(&key()).unwrap();
        std::mem::forget(stale);
        std::thread::sleep(Duration::from_millis(40));

        assert!(locks.status(&key()).unwrap().is_none());
        locks.acquire(&key()).unwrap();
    }

    #[test]
    fn wait_for_reclaims_abandoned_lock() {
        let tmp = TempDir::new().unwrap();
        let locks = locks(&tmp, Duration::from_millis(50));

        std::mem::forget(locks.acquire(&key()).unwrap());
        let started = Instant::now();
        locks.wait_for(&key(), Duration::from_secs(5)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!locks.record_path(&key()).exists());
    }

    #[test]
    fn wait_for_times_out_on_live_lock() {
        let tmp = TempDir::new().unwrap();
        let locks = locks(&tmp, Duration::from_secs(60));

        let _guard = locks.acquire(&key()).unwrap();
        let err = locks
            .wait_for(&key(), Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::LockTimeout { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn wait_for_returns_when_holder_releases() {
        let tmp = TempDir::new().unwrap();
        let locks = locks(&tmp, Duration::from_secs(60));
        let guard = locks.acquire(&key()).unwrap();

        std::thread::scope(|s| {
            s.spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                guard.release().unwrap();
            });
            locks.wait_for(&key(), Duration::from_secs(5)).unwrap();
        });
    }

    #[test]
    fn dead_holder_on_same_host_is_abandoned() {
        let tmp = TempDir::new().unwrap();
        let locks = locks(&tmp, Duration::from_secs(60));
        let now = now_millis();
        let entry = LockEntry {
            key: key(),
            holder: "crashed".to_string(),
            pid: i32::MAX as u32,
            host: locks.host.clone(),
            acquired_at_unix_ms: now,
            expires_at_unix_ms: now + 60_000,
        };
        locks.write_entry(&entry).unwrap();

        locks.acquire(&key()).unwrap();
    }

    #[test]
    fn corrupt_record_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let locks = locks(&tmp, Duration::from_secs(60));
        fs::write(locks.record_path(&key()), b"{not json").unwrap();

        assert!(locks.status(&key()).unwrap().is_none());
        locks.acquire(&key()).unwrap();
    }

    #[test]
    fn distinct_keys_do_not_contend() {
        let tmp = TempDir::new().unwrap();
        let locks = locks(&tmp, Duration::from_secs(60));
        let other = DirectoryKey::for_path(Path::new("/srv/files/music"));

        let _a = locks.acquire(&key()).unwrap();
        let _b = locks.acquire(&other).unwrap();
    }
}

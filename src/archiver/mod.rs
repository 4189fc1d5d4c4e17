//! The archive orchestrator consumed by the request layer.
//!
//! Composes fingerprinting, build locks, the archive builder and the store.
//! All methods are synchronous and safe to call from many threads at once;
//! the intentionally blocking calls are [`Archiver::wait_for_creation`] and
//! [`Archiver::serve_archive`] (and the build itself).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread::ThreadId;
use std::time::Instant;

use crate::builder::ArchiveBuilder;
use crate::config::ArchiverConfig;
use crate::directory::{DirectoryHandle, DirectoryKey};
use crate::error::{ArchiveError, Result};
use crate::fingerprint::{scan_directory, DirectoryScan};
use crate::lock::BuildLocks;
use crate::store::{now_unix, ArchiveStore, Artifact};


/// Outcome of a cleanup pass.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub deleted: Vec<Artifact>,
    pub failed: Vec<SweepFailure>,
    /// Artifacts left alone because their directory had a live lock.
    pub skipped_locked: usize,
    /// Partial builds and record-less artifact directories removed.
    pub orphans_removed: usize,
}

#[derive(Debug)]
pub struct SweepFailure {
    pub path: PathBuf,
    pub error: String,
}

pub struct Archiver {
    config: ArchiverConfig,
    store: ArchiveStore,
    locks: BuildLocks,
    builder: ArchiveBuilder,
    /// Lock tokens held by this instance, per key and holding thread.
    held: Mutex<HashMap<DirectoryKey, (String, ThreadId)>>,
    #[cfg(test)]
    builds: std::sync::atomic::AtomicUsize,
}

impl Archiver {
    /// Open the cache described by `config`, creating its layout if needed.
    pub fn new(config: ArchiverConfig) -> Result<Self> {
        config.validate()?;
        let store = ArchiveStore::open(&config.cache_root)?;
        let locks = BuildLocks::new(store.locks_dir(), config.max_build, config.poll_interval)?;
        let builder = ArchiveBuilder::new(store.tmp_dir(), config.compression_level);
        Ok(Self {
            config,
            store,
            locks,
            builder,
            held: Mutex::new(HashMap::new()),
            #[cfg(test)]
            builds: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &ArchiverConfig {
        &self.config
    }

    pub fn store(&self) -> &ArchiveStore {
        &self.store
    }

    pub fn locks(&self) -> &BuildLocks {
        &self.locks
    }

    /// Fingerprint and entry statistics of `dir` right now.
    pub fn scan(&self, dir: &DirectoryHandle) -> Result<DirectoryScan> {
        scan_directory(dir.path())
    }

    /// Like [`can_archive`](Self::can_archive), but says why not.
    pub fn check_archivable(&self, dir: &DirectoryHandle) -> Result<DirectoryScan> {
        let not_archivable = |reason: String| ArchiveError::NotArchivable {
            directory: dir.path().to_path_buf(),
            reason,
        };
        if !dir.is_accessible() {
            return Err(not_archivable("directory is not accessible".to_string()));
        }
        let scan = self
            .scan(dir)
            .map_err(|err| not_archivable(format!("directory cannot be read: {err}")))?;
        if scan.files == 0 {
            return Err(not_archivable(
                "directory contains no readable files".to_string(),
            ));
        }
        if let Some(max) = self.config.max_entries {
            if scan.entries() > max {
                return Err(not_archivable(format!(
                    "{} entries exceed the limit of {max}",
                    scan.entries()
                )));
            }
        }
        if let Some(max) = self.config.max_total_bytes {
            if scan.total_bytes > max {
                return Err(not_archivable(format!(
                    "{} bytes exceed the limit of {max}",
                    scan.total_bytes
                )));
            }
        }
        Ok(scan)
    }

    /// Whether `dir` is eligible for archiving at all.
    pub fn can_archive(&self, dir: &DirectoryHandle) -> bool {
        self.check_archivable(dir).is_ok()
    }

    /// The artifact matching the directory's current fingerprint, if any.
    pub fn current_archive(&self, dir: &DirectoryHandle) -> Result<Option<Artifact>> {
        let scan = self.scan(dir)?;
        self.store.find(&dir.key(), &scan.fingerprint)
    }

    pub fn is_archive_ready(&self, dir: &DirectoryHandle) -> Result<bool> {
        Ok(self.current_archive(dir)?.is_some())
    }

    /// Whether someone other than the calling thread holds the build lock.
    pub fn is_archiving(&self, dir: &DirectoryHandle) -> Result<bool> {
        let key = dir.key();
        let Some(entry) = self.locks.status(&key)? else {
            return Ok(false);
        };
        let held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        let ours = held.get(&key).is_some_and(|(token, thread)| {
            *token == entry.holder && *thread == std::thread::current().id()
        });
        Ok(!ours)
    }

    /// The current archive of `dir`, stamped as served.
    ///
    /// The stamp is written under the directory's build lock, so an expiry
    /// sweep either removed the archive first (and this returns `None`) or
    /// sees the fresh stamp and keeps it. A held lock is waited for, bounded by
    /// the configured wait timeout.
    pub fn serve_archive(&self, dir: &DirectoryHandle) -> Result<Option<Artifact>> {
        let key = dir.key();
        let started = Instant::now();
        let deadline = started + self.config.wait_timeout;

        loop {
            match self.locks.acquire(&key) {
                Ok(_guard) => {
                    let Some(current) = self.current_archive(dir)? else {
                        return Ok(None);
                    };
                    let served = self.store.mark_served(&current)?;
                    if let Some(artifact) = &served {
                        tracing::debug!(
                            target = "dir_archiver",
                            path = %artifact.path.display(),
                            "reusing published archive"
                        );
                    }
                    return Ok(served);
                }
                Err(ArchiveError::AlreadyLocked { .. }) => {
                    self.wait_until_unlocked(&key, started, deadline)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn get_archive_path(&self, dir: &DirectoryHandle) -> Result<PathBuf> {
        self.current_archive(dir)?
            .map(|artifact| artifact.path)
            .ok_or_else(|| ArchiveError::NotReady {
                directory: dir.path().to_path_buf(),
            })
    }

    /// Build and publish an archive of `dir`.
    ///
    /// Does not wait for the lock: if another party holds it this fails with
    /// [`ArchiveError::AlreadyLocked`] and the caller should use
    /// [`wait_for_creation`](Self::wait_for_creation). The lock is released on
    /// every exit path.
    pub fn create_archive(&self, dir: &DirectoryHandle) -> Result<Artifact> {
        let key = dir.key();
        let guard = self.locks.acquire(&key)?;
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.clone(), (guard.token().to_string(), std::thread::current().id()));

        let result = self.build_locked(dir);

        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&key);
        if let Err(err) = guard.release() {
            tracing::warn!(
                target = "dir_archiver",
                key = %key,
                error = %err,
                "failed to release build lock after build"
            );
        }
        result
    }

    fn build_locked(&self, dir: &DirectoryHandle) -> Result<Artifact> {
        let started = Instant::now();
        let scan = self.check_archivable(dir)?;
        let key = dir.key();

        // Another builder may have published between the caller's readiness
        // check and our lock acquisition.
        if let Some(existing) = self.store.find(&key, &scan.fingerprint)? {
            return Ok(existing);
        }

        tracing::info!(
            target = "dir_archiver",
            directory = %dir.path().display(),
            key = %key,
            fingerprint = %scan.fingerprint,
            files = scan.files,
            bytes = scan.total_bytes,
            "building archive"
        );

        let built = self.builder.build(dir).map_err(|err| {
            tracing::warn!(
                target = "dir_archiver",
                directory = %dir.path().display(),
                error = %err,
                "archive build failed"
            );
            err
        })?;
        #[cfg(test)]
        self.builds
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let artifact = match self.store.publish(dir, &scan.fingerprint, &built.temp_path) {
            Ok(artifact) => artifact,
            Err(err) => {
                let _ = std::fs::remove_file(&built.temp_path);
                return Err(err);
            }
        };

        tracing::info!(
            target = "dir_archiver",
            directory = %dir.path().display(),
            path = %artifact.path.display(),
            entries = built.entries.len(),
            skipped = built.skipped.len(),
            size_bytes = artifact.record.size_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "published archive"
        );
        Ok(artifact)
    }

    /// Wait for another party's build of `dir` to finish, then resolve it.
    ///
    /// If the lock goes away without a current artifact appearing (the holder
    /// failed, crashed, or was a cleanup pass) this caller builds it instead.
    /// Bounded by the configured wait timeout.
    pub fn wait_for_creation(&self, dir: &DirectoryHandle) -> Result<Artifact> {
        let key = dir.key();
        let started = Instant::now();
        let deadline = started + self.config.wait_timeout;

        loop {
            self.wait_until_unlocked(&key, started, deadline)?;

            if let Some(artifact) = self.current_archive(dir)? {
                return Ok(artifact);
            }

            match self.create_archive(dir) {
                Err(ArchiveError::AlreadyLocked { .. }) => {
                    if Instant::now() >= deadline {
                        return Err(ArchiveError::LockTimeout {
                            key: key.to_string(),
                            waited: started.elapsed(),
                        });
                    }
                }
                other => return other,
            }
        }
    }

    /// `LockTimeout` reports the time since `started`, not just this wait.
    fn wait_until_unlocked(
        &self,
        key: &DirectoryKey,
        started: Instant,
        deadline: Instant,
    ) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.locks.wait_for(key, remaining).map_err(|err| match err {
            ArchiveError::LockTimeout { key, .. } => ArchiveError::LockTimeout {
                key,
                waited: started.elapsed(),
            },
            other => other,
        })
    }

    /// Remove every artifact neither published nor served within `retention`.
    ///
    /// Directories with a live build lock are skipped. Each candidate is
    /// re-read under the lock, so an archive served since the listing is kept.
    /// A failure to delete one artifact is logged and recorded; the sweep
    /// carries on.
    pub fn delete_expired_archives(&self) -> Result<SweepReport> {
        let now = now_unix();
        let mut by_key: BTreeMap<DirectoryKey, Vec<Artifact>> = BTreeMap::new();
        for artifact in self.store.list_all(None)? {
            if artifact.idle(now) >= self.config.retention {
                by_key
                    .entry(artifact.key().clone())
                    .or_default()
                    .push(artifact);
            }
        }

        let mut report = SweepReport::default();
        let retention = self.config.retention;
        for (key, expired) in by_key {
            self.delete_under_lock(&key, expired, &mut report, |artifact| {
                artifact.idle(now_unix()) >= retention
            });
        }

        match self.store.sweep_orphans(self.config.max_build) {
            Ok(removed) => report.orphans_removed = removed,
            Err(err) => tracing::warn!(
                target = "dir_archiver",
                error = %err,
                "failed to sweep orphaned partial archives"
            ),
        }

        if !report.deleted.is_empty() || !report.failed.is_empty() {
            tracing::info!(
                target = "dir_archiver",
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                skipped_locked = report.skipped_locked,
                "expired archive sweep finished"
            );
        }
        Ok(report)
    }

    /// Remove artifacts of `dir` built from content that has since changed.
    ///
    /// Skipped entirely while anyone (this caller included) holds the lock
    /// for `dir`, so it never races a build that is about to publish.
    pub fn delete_obsolete_versions(&self, dir: &DirectoryHandle) -> Result<SweepReport> {
        let key = dir.key();
        let mut report = SweepReport::default();

        let candidates = self.store.list_all(Some(&key))?;
        if candidates.is_empty() {
            return Ok(report);
        }
        let current = match self.scan(dir) {
            Ok(scan) => Some(scan.fingerprint),
            Err(err) => {
                // A directory that vanished or became unreadable has no
                // current version; everything it left behind is obsolete.
                tracing::debug!(
                    target = "dir_archiver",
                    directory = %dir.path().display(),
                    error = %err,
                    "cannot fingerprint directory; treating all archives as obsolete"
                );
                None
            }
        };

        let obsolete: Vec<Artifact> = candidates
            .into_iter()
            .filter(|artifact| Some(artifact.fingerprint()) != current.as_ref())
            .collect();
        if !obsolete.is_empty() {
            self.delete_under_lock(&key, obsolete, &mut report, |_| true);
        }
        Ok(report)
    }

    fn delete_under_lock(
        &self,
        key: &DirectoryKey,
        artifacts: Vec<Artifact>,
        report: &mut SweepReport,
        still_deletable: impl Fn(&Artifact) -> bool,
    ) {
        let guard = match self.locks.acquire(key) {
            Ok(guard) => guard,
            Err(ArchiveError::AlreadyLocked { holder, .. }) => {
                tracing::debug!(
                    target = "dir_archiver",
                    key = %key,
                    holder = %holder,
                    "build in progress; leaving archives alone"
                );
                report.skipped_locked += artifacts.len();
                return;
            }
            Err(err) => {
                tracing::warn!(
                    target = "dir_archiver",
                    key = %key,
                    error = %err,
                    "cannot lock directory for cleanup"
                );
                report
                    .failed
                    .extend(artifacts.into_iter().map(|artifact| SweepFailure {
                        path: artifact.path,
                        error: err.to_string(),
                    }));
                return;
            }
        };

        for listed in artifacts {
            let artifact = match self.store.find(listed.key(), listed.fingerprint()) {
                Ok(Some(current)) if !still_deletable(&current) => continue,
                Ok(Some(current)) => current,
                // Already gone, or a record without its blob: delete tolerates both.
                Ok(None) | Err(_) => listed,
            };
            match self.store.delete(&artifact) {
                Ok(()) => {
                    tracing::debug!(
                        target = "dir_archiver",
                        path = %artifact.path.display(),
                        fingerprint = %artifact.fingerprint(),
                        "deleted archive"
                    );
                    report.deleted.push(artifact);
                }
                Err(err) => {
                    tracing::warn!(
                        target = "dir_archiver",
                        path = %artifact.path.display(),
                        error = %err,
                        "failed to delete archive"
                    );
                    report.failed.push(SweepFailure {
                        path: artifact.path,
                        error: err.to_string(),
                    });
                }
            }
        }
        drop(guard);
    }
}

use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Errors produced by the archive subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("directory {directory} cannot be archived: {reason}")]
    NotArchivable { directory: PathBuf, reason: String },

    #[error("failed to build archive of {directory}: {source}")]
    BuildFailed {
        directory: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {waited:?} waiting for archive lock {key}")]
    LockTimeout { key: String, waited: Duration },

    #[error("archive lock {key} is held by {holder}")]
    AlreadyLocked { key: String, holder: String },

    #[error("archive storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no current archive for {directory}")]
    NotReady { directory: PathBuf },

    #[error("path {path} is not under {root}")]
    PathOutsideRoot { path: PathBuf, root: PathBuf },

    #[error("invalid configuration {path}: {message}")]
    Config { path: PathBuf, message: String },

    /// Configuration rejected before it is tied to a file.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    /// Whether re-running the whole download preparation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::AlreadyLocked { .. })
    }

    pub(crate) fn storage(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Storage { path, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lock_contention_is_retryable() {
        let timeout = ArchiveError::LockTimeout {
            key: "abc".to_string(),
            waited: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());

        let not_archivable = ArchiveError::NotArchivable {
            directory: PathBuf::from("/srv/empty"),
            reason: "directory is empty".to_string(),
        };
        assert!(!not_archivable.is_retryable());
        assert!(not_archivable.to_string().contains("/srv/empty"));
    }
}

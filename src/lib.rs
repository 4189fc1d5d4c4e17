//! On-demand archives of browsable directories.
//!
//! Given a directory, the [`Archiver`] produces a downloadable `tar.zst`
//! artifact. It reuses a previously built artifact while the directory's
//! content is unchanged, rebuilds when it has changed, keeps concurrent
//! requests (threads and processes) from building the same directory twice,
//! and reclaims disk space from stale or superseded artifacts.
//!
//! # Architecture
//!
//! ```text
//! prepare_download (request layer)
//!     │
//!     └── Archiver
//!             ├── fingerprint   content state of a directory
//!             ├── lock          cross-process build locks
//!             ├── builder       directory -> tar.zst at a temp path
//!             └── store         (directory, fingerprint) -> published artifact
//! ```
//!
//! Browsing, routing and access control live outside this crate: callers
//! hand in a resolved [`DirectoryHandle`] carrying their accessibility
//! decision, and get back a URL from their [`UrlGenerator`].
//!
//! # Example
//!
//! ```rust,no_run
//! use dir_archiver::{prepare_download, Archiver, ArchiverConfig, BaseUrlGenerator, DirectoryHandle};
//! use std::path::Path;
//!
//! # fn main() -> dir_archiver::Result<()> {
//! let archiver = Archiver::new(ArchiverConfig::with_cache_root("/var/cache/dir-archiver"))?;
//! let urls = BaseUrlGenerator::for_archiver(&archiver);
//! let dir = DirectoryHandle::resolve(Path::new("/srv/files/photos"), true)?;
//! let prepared = prepare_download(&archiver, &dir, &urls)?;
//! println!("{}", prepared.archive_url);
//! # Ok(())
//! # }
//! ```

pub mod archiver;
pub mod builder;
pub mod config;
pub mod directory;
pub mod download;
pub mod error;
pub mod fingerprint;
pub mod lock;
pub mod path;
pub mod store;
pub mod token;

pub use archiver::{Archiver, SweepFailure, SweepReport};
pub use config::ArchiverConfig;
pub use directory::{DirectoryHandle, DirectoryKey};
pub use download::{prepare_download, BaseUrlGenerator, PreparedDownload, UrlGenerator};
pub use error::{ArchiveError, Result};
pub use fingerprint::{DirectoryScan, Fingerprint};
pub use store::{ArchiveStore, Artifact};

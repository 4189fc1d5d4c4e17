use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dir_archiver::{ArchiverConfig, DirectoryHandle};

const CONFIG_ENV: &str = "DIR_ARCHIVER_CONFIG";
const LOCAL_CONFIG: &str = "dir-archiver.toml";

pub(crate) fn load_config() -> Result<ArchiverConfig> {
    match config_path() {
        Some(path) => ArchiverConfig::load(&path)
            .with_context(|| format!("loading configuration '{}'", path.display())),
        None => Ok(ArchiverConfig::default()),
    }
}

fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    let local = Path::new(LOCAL_CONFIG);
    local.is_file().then(|| local.to_path_buf())
}

/// Canonicalize `raw`; it is accessible only when inside `browse_root`
/// (or when no browse root is configured).
pub(crate) fn resolve_directory(config: &ArchiverConfig, raw: &str) -> Result<DirectoryHandle> {
    let path = std::fs::canonicalize(raw).with_context(|| format!("resolving directory '{raw}'"))?;
    let accessible = match &config.browse_root {
        Some(root) => {
            let root = std::fs::canonicalize(root)
                .with_context(|| format!("resolving browse root '{}'", root.display()))?;
            path.starts_with(&root)
        }
        None => true,
    };
    if !accessible {
        tracing::debug!(
            target = "dir_archiver",
            directory = %path.display(),
            "directory is outside the browse root"
        );
    }
    Ok(DirectoryHandle::new(path, accessible))
}

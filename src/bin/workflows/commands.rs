use anyhow::{Context, Result};
use dir_archiver::path::normalize_directory;
use dir_archiver::{prepare_download, Archiver, BaseUrlGenerator, SweepReport};
use time::OffsetDateTime;

fn open_archiver() -> Result<Archiver> {
    let config = crate::workflows::load_config()?;
    let cache_root = config.cache_root.clone();
    Archiver::new(config)
        .with_context(|| format!("opening archive cache '{}'", cache_root.display()))
}

pub(crate) fn prepare(raw_dir: &str) -> Result<()> {
    let archiver = open_archiver()?;
    let dir = crate::workflows::resolve_directory(archiver.config(), raw_dir)?;
    let urls = BaseUrlGenerator::for_archiver(&archiver);

    let prepared = prepare_download(&archiver, &dir, &urls)
        .with_context(|| format!("preparing download of '{}'", dir.path().display()))?;
    println!(
        "{}",
        serde_json::to_string(&prepared).context("serializing download response")?
    );
    Ok(())
}

pub(crate) fn store_status() -> Result<()> {
    let archiver = open_archiver()?;
    let status = archiver.store().status().context("reading archive cache")?;
    println!("cache:     {}", normalize_directory(&status.root.to_string_lossy()));
    println!("archives:  {}", status.artifacts);
    println!("bytes:     {}", status.bytes);
    Ok(())
}

pub(crate) fn directory_status(raw_dir: &str) -> Result<()> {
    let archiver = open_archiver()?;
    let dir = crate::workflows::resolve_directory(archiver.config(), raw_dir)?;

    println!("directory:   {}", normalize_directory(&dir.path().to_string_lossy()));
    println!("key:         {}", dir.key());
    match archiver.check_archivable(&dir) {
        Ok(scan) => {
            println!("fingerprint: {}", scan.fingerprint);
            println!(
                "entries:     {} files, {} directories, {} bytes",
                scan.files, scan.directories, scan.total_bytes
            );
            if scan.unreadable > 0 {
                println!("unreadable:  {}", scan.unreadable);
            }
            println!("archivable:  yes");
        }
        Err(err) => println!("archivable:  no ({err})"),
    }

    match archiver.locks().status(&dir.key())? {
        Some(entry) => println!(
            "archiving:   yes (holder {} pid {} on {})",
            entry.holder, entry.pid, entry.host
        ),
        None => println!("archiving:   no"),
    }

    // An unreadable directory has no current archive; that is not an error here.
    let current = archiver.current_archive(&dir).ok().flatten();
    match &current {
        Some(artifact) => {
            println!("ready:       yes");
            println!("archive:     {}", artifact.path.display());
            println!("size:        {} bytes", artifact.record.size_bytes);
            println!(
                "created:     {}",
                format_unix(artifact.record.created_at_unix)
            );
            if artifact.record.last_served_unix > 0 {
                println!(
                    "served:      {}",
                    format_unix(artifact.record.last_served_unix)
                );
            }
        }
        None => println!("ready:       no"),
    }

    let obsolete = archiver
        .store()
        .list_all(Some(&dir.key()))?
        .into_iter()
        .filter(|artifact| Some(artifact) != current.as_ref())
        .count();
    if obsolete > 0 {
        println!("obsolete:    {obsolete}");
    }
    Ok(())
}

pub(crate) fn sweep() -> Result<()> {
    let archiver = open_archiver()?;
    let report = archiver
        .delete_expired_archives()
        .context("deleting expired archives")?;
    print_report("expired", &report);
    Ok(())
}

pub(crate) fn obsolete(raw_dir: &str) -> Result<()> {
    let archiver = open_archiver()?;
    let dir = crate::workflows::resolve_directory(archiver.config(), raw_dir)?;
    let report = archiver
        .delete_obsolete_versions(&dir)
        .with_context(|| format!("deleting obsolete archives of '{}'", dir.path().display()))?;
    print_report("obsolete", &report);
    Ok(())
}

fn print_report(kind: &str, report: &SweepReport) {
    for artifact in &report.deleted {
        println!("[{kind}] deleted {}", artifact.path.display());
    }
    for failure in &report.failed {
        println!("[{kind}] failed {}: {}", failure.path.display(), failure.error);
    }
    println!(
        "[{kind}] {} deleted, {} failed, {} skipped (build in progress), {} orphans removed",
        report.deleted.len(),
        report.failed.len(),
        report.skipped_locked,
        report.orphans_removed
    );
}

fn format_unix(secs: u64) -> String {
    let Ok(at) = i64::try_from(secs)
        .map_err(|_| ())
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).map_err(|_| ()))
    else {
        return secs.to_string();
    };
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        at.year(),
        at.month() as u8,
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

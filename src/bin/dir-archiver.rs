use std::process::ExitCode;

use anyhow::{bail, Result};
use dir_archiver::ArchiveError;

mod workflows;

/// `EX_TEMPFAIL` from sysexits.h: try again later.
const EXIT_LOCK_TIMEOUT: u8 = 75;
const EXIT_NOT_ARCHIVABLE: u8 = 2;

pub(crate) fn usage() -> &'static str {
    "Usage:\n  dir-archiver prepare <directory>\n  dir-archiver status [<directory>]\n  dir-archiver sweep\n  dir-archiver obsolete <directory>\n\nConfiguration is read from $DIR_ARCHIVER_CONFIG, else ./dir-archiver.toml if present."
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn run(args: &[String]) -> Result<()> {
    match args {
        [cmd, dir] if cmd == "prepare" => workflows::prepare(dir),
        [cmd] if cmd == "status" => workflows::store_status(),
        [cmd, dir] if cmd == "status" => workflows::directory_status(dir),
        [cmd] if cmd == "sweep" => workflows::sweep(),
        [cmd, dir] if cmd == "obsolete" => workflows::obsolete(dir),
        _ => bail!(usage()),
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err
        .chain()
        .find_map(|cause| cause.downcast_ref::<ArchiveError>())
    {
        Some(ArchiveError::NotArchivable { .. }) => EXIT_NOT_ARCHIVABLE,
        Some(ArchiveError::LockTimeout { .. }) => EXIT_LOCK_TIMEOUT,
        _ => 1,
    }
}

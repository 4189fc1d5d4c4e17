mod commands;
mod layout;

pub(crate) use commands::{directory_status, obsolete, prepare, store_status, sweep};
pub(crate) use layout::{load_config, resolve_directory};

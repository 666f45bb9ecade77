use std::env;
use std::path::PathBuf;

/// Default base directory for the contact database.
pub fn default_base_dir() -> PathBuf {
    dirs_home().join(".identity-reconciliation")
}

/// Default database file inside `base`.
pub fn default_db_path(base: &std::path::Path) -> PathBuf {
    base.join("contacts.db")
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

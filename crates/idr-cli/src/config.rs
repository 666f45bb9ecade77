//! Layered configuration: defaults < TOML file < environment < command line.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Contents of an optional `idr.toml`.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Path to the SQLite database.
    pub database: Option<PathBuf>,
    /// Listen address for `idr serve`.
    pub bind: Option<SocketAddr>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }
}

/// Values given on the command line; they win over everything else.
#[derive(Debug, Default)]
pub struct Overrides {
    pub database: Option<PathBuf>,
    pub bind: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database: PathBuf,
    pub bind: SocketAddr,
}

impl Config {
    pub fn load(config_file: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let file = match config_file {
            Some(path) => FileConfig::read(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok(), overrides)
    }

    /// Merge the layers. `env` looks up environment variables by name.
    pub fn resolve(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
        overrides: Overrides,
    ) -> Result<Self> {
        let env_db = env("IDR_DB").map(PathBuf::from).or_else(|| {
            env("IDR_DATA_DIR").map(|dir| idr_store::default_db_path(Path::new(&dir)))
        });
        let env_bind = env("IDR_BIND")
            .map(|v| {
                v.parse::<SocketAddr>()
                    .with_context(|| format!("IDR_BIND is not a socket address: {v}"))
            })
            .transpose()?;

        let database = overrides
            .database
            .or(env_db)
            .or(file.database)
            .unwrap_or_else(|| idr_store::default_db_path(&idr_store::default_base_dir()));
        let bind = match overrides.bind.or(env_bind).or(file.bind) {
            Some(addr) => addr,
            None => DEFAULT_BIND.parse()?,
        };

        Ok(Self { database, bind })
    }
}

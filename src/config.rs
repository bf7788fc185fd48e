//! Process settings and the routing catalog.
//!
//! Settings are layered: built-in defaults, then an optional file named by
//! `KOBOLD_CONFIG_FILE` (format from its extension), then `KOBOLD_*`
//! environment variables with `__` between nested keys, e.g.
//! `KOBOLD_SCHEDULER__POOL_SIZE=8`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;

use crate::git::CommitIdentity;
use crate::handler::HandlerKind;
use crate::store::{Catalog, CatalogError};

/// Names the optional settings file.
pub const CONFIG_FILE_VAR: &str = "KOBOLD_CONFIG_FILE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid catalog {path}: {source}")]
    Catalog {
        path: PathBuf,
        #[source]
        source: CatalogError,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub scheduler: SchedulerSettings,
    pub storage: StorageSettings,
    pub cache: CacheSettings,
    pub rewriter: RewriterSettings,
    pub git: GitSettings,
    pub log: LogSettings,
    /// TOML file with channels, decoders, post-hooks and pipelines. Without
    /// one the catalog is empty and every event is rejected.
    #[serde(default)]
    pub catalog_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub webhook_addr: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    pub debounce_ms: u64,
    pub pool_size: usize,
    pub handler: HandlerKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Journal file. Tasks are kept in memory only when unset.
    #[serde(default)]
    pub journal: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewriterSettings {
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitSettings {
    pub author_name: String,
    pub author_email: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    pub format: LogFormat,
}

impl Settings {
    /// Loads settings from the process environment.
    pub fn load() -> Result<Self> {
        let file = std::env::var_os(CONFIG_FILE_VAR).map(PathBuf::from);
        Self::build(file.as_deref(), None)
    }

    /// Loads settings from an optional file and an environment. `env` of
    /// `None` reads the process environment.
    pub fn build(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let identity = CommitIdentity::default();

        let mut builder = Config::builder()
            .set_default("server.webhook_addr", "0.0.0.0:8080")?
            .set_default("scheduler.debounce_ms", 1000)?
            .set_default("scheduler.pool_size", 4)?
            .set_default("scheduler.handler", HandlerKind::default().to_string())?
            .set_default("cache.dir", "kobold-data/cache")?
            .set_default("git.author_name", identity.name)?
            .set_default("git.author_email", identity.email)?
            .set_default("log.format", "text")?;

        if let Some(path) = file {
            builder = builder.add_source(File::from(path));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix("KOBOLD")
                    .prefix_separator("_")
                    .separator("__")
                    .source(env),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.scheduler.debounce_ms)
    }

    pub fn identity(&self) -> CommitIdentity {
        CommitIdentity {
            name: self.git.author_name.clone(),
            email: self.git.author_email.clone(),
        }
    }

    /// Loads and validates the catalog, or an empty one when no file is set.
    pub fn catalog(&self) -> Result<Catalog> {
        match &self.catalog_file {
            Some(path) => load_catalog(path),
            None => Ok(Catalog::default()),
        }
    }
}

/// Reads a TOML catalog:
///
/// ```toml
/// [[channel]]
/// name = "dockerhub"
/// decoder = "dockerhub"
///
/// [[decoder]]
/// name = "dockerhub"
/// script = "jq -r '.repository.repo_name + \":\" + .push_data.tag'"
///
/// [[pipeline]]
/// name = "infra"
/// repo_uri = "https://git.example.com/infra?ref=main&pkg=apps"
/// dest_branch = "kobold"
/// channels = ["dockerhub"]
/// ```
pub fn load_catalog(path: &Path) -> Result<Catalog> {
    let catalog: Catalog = Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml))
        .build()?
        .try_deserialize()?;

    catalog.validate().map_err(|source| ConfigError::Catalog {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(catalog)
}

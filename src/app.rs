//! Wiring shared by the server and the one-shot CLI.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ConfigError, LogFormat, Settings};
use crate::git::RepoCache;
use crate::handler::HandlerKindError;
use crate::metrics::Metrics;
use crate::plugin::{CommandRewriter, ImageRewriter};
use crate::pool::{Pool, PoolConfig};
use crate::store::{Catalog, FileTaskStore, MemoryTaskStore, StoreError, TaskStore};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("open task store: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Handler(#[from] HandlerKindError),
}

/// Installs the global subscriber. Logs go to stderr so stdout stays free
/// for handler output.
pub fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kobold=info".into());

    let registry = tracing_subscriber::registry().with(filter);
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    match format {
        LogFormat::Json => registry.with(layer.json()).init(),
        LogFormat::Text => registry.with(layer).init(),
    }
}

/// The catalog, the store and a pool over them.
pub struct App {
    pub catalog: Arc<Catalog>,
    pub store: Arc<dyn TaskStore>,
    pub pool: Pool,
}

impl App {
    /// Builds everything `settings` describes. The pool stops when
    /// `shutdown` is cancelled.
    pub fn build(
        settings: &Settings,
        shutdown: &CancellationToken,
        metrics: Metrics,
    ) -> Result<Self, AppError> {
        let catalog = settings.catalog()?;
        let store: Arc<dyn TaskStore> = match &settings.storage.journal {
            Some(path) => Arc::new(FileTaskStore::open(path, catalog.clone())?),
            None => {
                warn!("no journal configured, tasks are kept in memory only");
                Arc::new(MemoryTaskStore::new(catalog.clone())?)
            }
        };

        let rewriter = settings
            .rewriter
            .command
            .as_ref()
            .map(|command| Arc::new(CommandRewriter::new(command)) as Arc<dyn ImageRewriter>);
        let handler = settings
            .scheduler
            .handler
            .build(rewriter, settings.identity(), metrics.clone())?;

        let cache = Arc::new(RepoCache::new(&settings.cache.dir, metrics.clone()));
        let pool = Pool::new(
            shutdown,
            Arc::clone(&store),
            cache,
            handler,
            PoolConfig::new(settings.scheduler.pool_size).with_metrics(metrics),
        );

        Ok(App {
            catalog: Arc::new(catalog),
            store,
            pool,
        })
    }
}

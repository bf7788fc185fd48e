//! Worker pool backed by the task store.
//!
//! Events are first queued with [`Pool::queue`], which decodes them and
//! stores one pending task per subscribed pipeline. [`Pool::dispatch`] later
//! groups everything pending and hands each group to a worker. At most
//! `size` workers run at once.
//!
//! # Claims
//!
//! A worker owns a group only after moving all of its tasks from `pending`
//! to `running` with a single compare-and-swap. If the store reports that
//! any member was not swapped, some other dispatcher got there first. The
//! pool does not try to recover from that: it records a fatal error, cancels
//! itself and lets [`Pool::wait`] report it.
//!
//! # Failures
//!
//! - handler errors mark the group `failure` and work continues
//! - store errors and claim mismatches are fatal for the whole pool

#[cfg(test)]
mod tests;

use std::io;
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::git::RepoCache;
use crate::handler::{Handler, HandlerReport};
use crate::metrics::Metrics;
use crate::plugin::{
    CommandDecoder, CommandHookRunner, DecoderRunner, HookRunner, PluginError, lines,
};
use crate::store::{CompSwap, StoreError, TaskStore};
use crate::types::{PackageUri, TaskGroup, TaskId, TaskStatus};

/// Why an event could not be turned into image references.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("event contains no image references")]
    Empty,
}

/// Errors from [`Pool::queue`].
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("not decodable: {0}")]
    NotDecodable(#[from] DecodeError),

    #[error("store: {0}")]
    Store(StoreError),

    #[error("read events: {0}")]
    Read(#[from] io::Error),
}

impl QueueError {
    /// True for errors that only affect the one event.
    pub fn is_per_event(&self) -> bool {
        matches!(self, QueueError::ChannelNotFound(_) | QueueError::NotDecodable(_))
    }
}

/// Fatal pool errors.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("attempt to set non-{required} tasks to {status}: swapped={swapped:?} ids={expected:?}")]
    ClaimMismatch {
        required: TaskStatus,
        status: TaskStatus,
        expected: Vec<TaskId>,
        swapped: Vec<TaskId>,
    },

    #[error("pool cancelled")]
    Cancelled,
}

/// Pool settings and plugins.
#[derive(Clone)]
pub struct PoolConfig {
    /// Maximum number of concurrently running groups, and fetches during
    /// cache fill.
    pub size: usize,
    pub decoder: Arc<dyn DecoderRunner>,
    pub hooks: Arc<dyn HookRunner>,
    pub metrics: Metrics,
}

impl PoolConfig {
    pub fn new(size: usize) -> Self {
        PoolConfig {
            size: size.max(1),
            decoder: Arc::new(CommandDecoder),
            hooks: Arc::new(CommandHookRunner),
            metrics: Metrics::noop(),
        }
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn DecoderRunner>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_hook_runner(mut self, hooks: Arc<dyn HookRunner>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Cheap to clone; clones share the same workers.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    store: Arc<dyn TaskStore>,
    cache: Arc<RepoCache>,
    handler: Arc<dyn Handler>,
    decoder: Arc<dyn DecoderRunner>,
    hooks: Arc<dyn HookRunner>,
    metrics: Metrics,
    size: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    token: CancellationToken,
    fatal: OnceLock<PoolError>,
}

impl Pool {
    /// Creates a pool whose token is a child of `parent`.
    pub fn new(
        parent: &CancellationToken,
        store: Arc<dyn TaskStore>,
        cache: Arc<RepoCache>,
        handler: Arc<dyn Handler>,
        config: PoolConfig,
    ) -> Self {
        Pool {
            inner: Arc::new(PoolInner {
                store,
                cache,
                handler,
                decoder: config.decoder,
                hooks: config.hooks,
                metrics: config.metrics,
                size: config.size,
                permits: Arc::new(Semaphore::new(config.size)),
                tracker: TaskTracker::new(),
                token: parent.child_token(),
                fatal: OnceLock::new(),
            }),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Decodes `raw` and stores one pending task per pipeline subscribed to
    /// `channel`.
    ///
    /// Without a decoder the payload is read as newline-separated
    /// references; surrounding whitespace and blank lines are dropped.
    pub async fn queue(&self, channel: &str, raw: &[u8]) -> Result<Vec<TaskId>, QueueError> {
        let result = self.inner.queue(channel, raw).await;

        match &result {
            Ok(ids) => info!(channel, tasks = ids.len(), "task queued"),
            Err(e) => warn!(channel, error = %e, "task rejected"),
        }
        self.inner.metrics.message_received(channel, result.is_err());

        result
    }

    /// Queues every non-blank line of `reader` as its own event on
    /// `channel`, stopping at the first error.
    ///
    /// Returns the ids of every task created.
    pub async fn queue_lines<R>(&self, channel: &str, reader: R) -> Result<Vec<TaskId>, QueueError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut events = reader.split(b'\n');
        let mut ids = Vec::new();
        while let Some(line) = events.next_segment().await? {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            ids.extend(self.queue(channel, &line).await?);
        }
        Ok(ids)
    }

    /// Launches one worker per pending task group and returns once all of
    /// them are launched.
    ///
    /// # Errors
    ///
    /// Fails without launching anything if the pool is cancelled, already
    /// hit a fatal error, or cannot list pending groups.
    #[instrument(skip_all)]
    pub async fn dispatch(&self) -> Result<(), PoolError> {
        let inner = &self.inner;

        if inner.token.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        if let Some(e) = inner.fatal.get() {
            return Err(e.clone());
        }
        inner.metrics.dispatch_cycle();

        let groups = match inner.store.task_groups_list_pending().await {
            Ok(groups) => groups,
            Err(e) => return Err(inner.fail(PoolError::Store(e))),
        };
        if groups.is_empty() {
            debug!("nothing pending");
            return Ok(());
        }
        info!(groups = groups.len(), "dispatching task groups");

        let uris: Vec<PackageUri> = groups.iter().map(|g| g.repo_uri.clone()).collect();
        if let Err(e) = inner.cache.fill(&inner.token, inner.size, &uris).await {
            warn!(error = %e, "failed to fill repository cache");
        }

        // Every cycle copies into its own namespace, dropped once the
        // cycle's workers are all done.
        let namespace = Uuid::new_v4().to_string();
        let cycle = TaskTracker::new();

        for group in groups {
            let permit = tokio::select! {
                _ = inner.token.cancelled() => break,
                permit = Arc::clone(&inner.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = Arc::clone(inner);
            let namespace = namespace.clone();
            inner.tracker.spawn(cycle.track_future(async move {
                let _permit = permit;
                worker.work(&namespace, group).await;
            }));
        }

        cycle.close();
        let purger = Arc::clone(inner);
        inner.tracker.spawn(async move {
            cycle.wait().await;
            if let Err(e) = purger.cache.purge(&namespace).await {
                warn!(namespace, error = %e, "failed to purge cache namespace");
            }
        });

        Ok(())
    }

    /// Waits for every launched worker and namespace purge, then returns the
    /// first fatal error, if any.
    pub async fn wait(&self) -> Result<(), PoolError> {
        let inner = &self.inner;
        inner.tracker.close();
        inner.tracker.wait().await;
        inner.tracker.reopen();

        match inner.fatal.get() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Cancels the pool. Workers that have not claimed their group yet skip
    /// it; running handlers see the token.
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }
}

impl PoolInner {
    async fn queue(&self, channel: &str, raw: &[u8]) -> Result<Vec<TaskId>, QueueError> {
        let script = match self.store.channel_decoder_get(channel).await {
            Ok(script) => script,
            Err(StoreError::ChannelNotFound(name)) => return Err(QueueError::ChannelNotFound(name)),
            Err(e) => return Err(QueueError::Store(e)),
        };

        let refs = match script {
            None => lines(&String::from_utf8_lossy(raw)),
            Some(script) => self
                .decoder
                .decode(&self.token, channel, &script, raw)
                .await
                .map_err(DecodeError::from)?,
        };
        if refs.is_empty() {
            return Err(DecodeError::Empty.into());
        }

        let ids = self
            .store
            .tasks_append(&refs, channel)
            .await
            .map_err(|e| match e {
                StoreError::ChannelNotFound(name) => QueueError::ChannelNotFound(name),
                other => QueueError::Store(other),
            })?;

        for image in &refs {
            self.metrics.image_seen(image);
        }
        Ok(ids)
    }

    /// Records the first fatal error and stops the pool.
    fn fail(&self, e: PoolError) -> PoolError {
        error!(error = %e, "fatal pool error");
        let _ = self.fatal.set(e.clone());
        self.token.cancel();
        e
    }

    /// Runs a compare-and-swap that must change every member of `group`.
    async fn swap_all(&self, group: &TaskGroup, swap: CompSwap) -> Result<(), PoolError> {
        let swapped = self.store.task_groups_status_comp_swap(&swap).await?;
        if swapped != group.task_ids {
            return Err(PoolError::ClaimMismatch {
                required: swap.required_status,
                status: swap.status,
                expected: group.task_ids.clone(),
                swapped,
            });
        }
        Ok(())
    }

    #[instrument(skip_all, fields(fingerprint = %group.fingerprint, repo = %group.repo_uri.repo))]
    async fn work(&self, namespace: &str, group: TaskGroup) {
        if self.token.is_cancelled() {
            debug!("pool cancelled, skipping task group");
            return;
        }

        if let Err(e) = self.swap_all(&group, CompSwap::claim(&group)).await {
            self.fail(e);
            return;
        }
        info!("task group dispatched");

        let repo = group.repo_uri.repo.as_str();
        self.metrics.run_started(repo);

        let report = match self.cache.get(namespace, repo).await {
            Ok(workdir) => {
                self.handler
                    .handle(&self.token, &workdir, &group, self.hooks.as_ref())
                    .await
            }
            Err(e) => HandlerReport::failed(vec![], e.into()),
        };

        let (status, reason) = match &report.result {
            Ok(()) => (TaskStatus::Success, None),
            Err(e) => (TaskStatus::Failure, Some(e.to_string())),
        };

        let done = CompSwap::complete(&group, status, report.warnings, reason);
        let result = self.swap_all(&group, done).await;

        info!(%status, "task group done");
        self.metrics.run_outcome(status.as_str(), repo);
        self.metrics.run_finished(repo);

        if let Err(e) = result {
            self.fail(e);
        }
    }
}

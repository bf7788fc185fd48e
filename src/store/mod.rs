//! Task storage.
//!
//! The store is the single source of truth for task status. The worker pool
//! never coordinates through in-process locks: every claim is a conditional
//! bulk update ([`TaskStore::task_groups_status_comp_swap`]) that only touches
//! rows still in the expected status, so several pools may share one store.
//!
//! # Implementations
//!
//! - [`MemoryTaskStore`]: process-local, for tests and dry runs
//! - [`FileTaskStore`]: append-only JSON Lines journal, fsynced per write
//!
//! Both delegate the status machine to [`table::TaskTable`] so they cannot
//! drift apart.

pub mod catalog;
pub mod file;
pub mod fsync;
pub mod journal;
pub mod memory;
pub(crate) mod table;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Fingerprint, Task, TaskGroup, TaskId, TaskStatus};

pub use catalog::{Catalog, CatalogError, Channel, Decoder, Pipeline};
pub use file::FileTaskStore;
pub use memory::MemoryTaskStore;

/// Errors from task storage.
///
/// Cloneable so a fatal store error can be reported both to the worker that
/// hit it and to whoever waits on the pool.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The channel is not part of the catalog.
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    /// A compare-and-swap asked for a transition the status machine forbids.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// The catalog handed to the store is inconsistent.
    #[error("invalid catalog: {0}")]
    Catalog(#[from] CatalogError),

    /// A journal line other than the last one could not be parsed.
    #[error("journal corrupt at line {line}: {details}")]
    Corrupt { line: usize, details: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// A previous writer panicked while holding the store lock.
    #[error("store lock poisoned")]
    Poisoned,

    /// A failed append could not be rolled back. The journal tail is in an
    /// unknown state, so no further events are written.
    #[error("journal {0} is unwritable after a failed append")]
    JournalUnwritable(String),
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Json(Arc::new(e))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Parameters of a conditional bulk status update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompSwap {
    /// Stamped onto every swapped task.
    pub fingerprint: Fingerprint,
    /// The status to move to.
    pub status: TaskStatus,
    /// Only tasks currently in this status are changed.
    pub required_status: TaskStatus,
    /// Candidate task ids.
    pub ids: Vec<TaskId>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub failure_reason: Option<String>,
}

impl CompSwap {
    /// A claim: `pending → running` for the whole group.
    pub fn claim(group: &TaskGroup) -> Self {
        CompSwap {
            fingerprint: group.fingerprint.clone(),
            status: TaskStatus::Running,
            required_status: TaskStatus::Pending,
            ids: group.task_ids.clone(),
            warnings: Vec::new(),
            failure_reason: None,
        }
    }

    /// A completion: `running → status` with the run's warnings and reason.
    pub fn complete(
        group: &TaskGroup,
        status: TaskStatus,
        warnings: Vec<String>,
        failure_reason: Option<String>,
    ) -> Self {
        CompSwap {
            fingerprint: group.fingerprint.clone(),
            status,
            required_status: TaskStatus::Running,
            ids: group.task_ids.clone(),
            warnings,
            failure_reason,
        }
    }
}

/// Durable task storage consumed by the pool.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Returns the decoder script of a channel, or `None` if the channel has
    /// no decoder.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ChannelNotFound`] for an unknown channel.
    async fn channel_decoder_get(&self, channel: &str) -> Result<Option<String>>;

    /// Creates one pending task per pipeline subscribed to `channel`.
    ///
    /// Returns the new task ids. A channel without subscribers yields none.
    async fn tasks_append(&self, messages: &[String], channel: &str) -> Result<Vec<TaskId>>;

    /// Groups all pending tasks by repository, destination branch and
    /// post-hook.
    async fn task_groups_list_pending(&self) -> Result<Vec<TaskGroup>>;

    /// Atomically moves every task in `swap.ids` whose status equals
    /// `swap.required_status` to `swap.status`.
    ///
    /// Returns exactly the ids that changed, in the order of `swap.ids`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] if the status machine forbids
    /// `required_status → status`; nothing is changed in that case.
    async fn task_groups_status_comp_swap(&self, swap: &CompSwap) -> Result<Vec<TaskId>>;

    /// Returns every task, oldest first.
    async fn tasks_list(&self) -> Result<Vec<Task>>;
}

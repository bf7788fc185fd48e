//! Task group handlers.
//!
//! A handler does the actual work for one claimed task group inside a
//! private copy of the repository. The pool turns its report into the
//! group's terminal status.

pub mod kobold;
pub mod simple;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::git::{CacheError, CommitIdentity, GitError};
use crate::metrics::Metrics;
use crate::plugin::{HookRunner, ImageRewriter, PluginError};
use crate::types::TaskGroup;

pub use kobold::KoboldHandler;
pub use simple::{ErrorHandler, PrintHandler};

/// Why a handler failed. The message becomes the tasks' failure reason.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("git: {0}")]
    Git(#[from] GitError),

    #[error("repository copy: {0}")]
    Cache(#[from] CacheError),

    #[error("package directory {0} does not exist")]
    MissingPackage(PathBuf),

    #[error("package path {0:?} leaves the repository")]
    UnsafePackage(String),

    #[error("rewrite: {0}")]
    Rewrite(#[source] PluginError),

    #[error("hook: {0}")]
    Hook(#[source] PluginError),

    #[error("serialize task group: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("task handler error")]
    Thrown,

    #[error("cancelled")]
    Cancelled,
}

/// Outcome of one handler run.
///
/// Warnings are kept even when the run fails.
#[derive(Debug)]
pub struct HandlerReport {
    pub warnings: Vec<String>,
    pub result: Result<(), HandlerError>,
}

impl HandlerReport {
    pub fn ok(warnings: Vec<String>) -> Self {
        HandlerReport {
            warnings,
            result: Ok(()),
        }
    }

    pub fn failed(warnings: Vec<String>, error: HandlerError) -> Self {
        HandlerReport {
            warnings,
            result: Err(error),
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Processes `group` inside `workdir`, a disposable copy of the
    /// group's repository. Implementations should stop early once `token` is
    /// cancelled.
    async fn handle(
        &self,
        token: &CancellationToken,
        workdir: &Path,
        group: &TaskGroup,
        hooks: &dyn HookRunner,
    ) -> HandlerReport;
}

/// Handler selected in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Rewrite, commit, push and run the post-hook.
    #[default]
    Kobold,
    /// Print each group as JSON.
    Print,
    /// Fail every group.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerKindError {
    #[error("unknown task handler: {0}")]
    Unknown(String),

    #[error("the kobold handler needs a rewriter command")]
    RewriterRequired,
}

impl FromStr for HandlerKind {
    type Err = HandlerKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kobold" => Ok(HandlerKind::Kobold),
            "print" => Ok(HandlerKind::Print),
            "error" => Ok(HandlerKind::Error),
            other => Err(HandlerKindError::Unknown(other.to_string())),
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandlerKind::Kobold => "kobold",
            HandlerKind::Print => "print",
            HandlerKind::Error => "error",
        })
    }
}

impl HandlerKind {
    /// Builds the handler once for the lifetime of the pool.
    pub fn build(
        self,
        rewriter: Option<Arc<dyn ImageRewriter>>,
        identity: CommitIdentity,
        metrics: Metrics,
    ) -> Result<Arc<dyn Handler>, HandlerKindError> {
        Ok(match self {
            HandlerKind::Kobold => {
                let rewriter = rewriter.ok_or(HandlerKindError::RewriterRequired)?;
                Arc::new(KoboldHandler::new(rewriter, identity, metrics))
            }
            HandlerKind::Print => Arc::new(PrintHandler),
            HandlerKind::Error => Arc::new(ErrorHandler),
        })
    }
}

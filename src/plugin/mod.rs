//! External collaborators: payload decoders, post-hooks and the image
//! rewriter.
//!
//! The pool and handlers only see the traits. The shipped implementations in
//! [`command`] run configured shell commands.

pub mod command;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::types::TaskGroup;

pub use command::{CommandDecoder, CommandHookRunner, CommandRewriter};

/// Errors from running a plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The process could not be started or its pipes failed.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited unsuccessfully.
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("cancelled")]
    Cancelled,
}

/// Turns a raw event payload into image references.
#[async_trait]
pub trait DecoderRunner: Send + Sync {
    /// Decodes `payload` received on `channel` using `script`. Gives up with
    /// [`PluginError::Cancelled`] once `token` fires.
    async fn decode(
        &self,
        token: &CancellationToken,
        channel: &str,
        script: &str,
        payload: &[u8],
    ) -> Result<Vec<String>, PluginError>;
}

/// Runs a task group's post-hook after changes were pushed.
#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Does nothing if the group has no post-hook.
    async fn run(
        &self,
        group: &TaskGroup,
        message: &str,
        changes: &[String],
        warnings: &[String],
    ) -> Result<(), PluginError>;
}

/// What a rewrite changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteOutcome {
    /// One human-readable line per changed reference.
    pub changes: Vec<String>,
    pub warnings: Vec<String>,
}

/// Rewrites image references inside a package directory.
#[async_trait]
pub trait ImageRewriter: Send + Sync {
    async fn rewrite(
        &self,
        token: &CancellationToken,
        package_dir: &Path,
        refs: &[String],
    ) -> Result<RewriteOutcome, PluginError>;
}

/// Splits plugin output into trimmed, non-empty lines.
pub(crate) fn lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

//! The image-update handler.
//!
//! For one task group:
//!
//! 1. check out `origin/<ref>` in the private copy
//! 2. run the rewriter in the package directory with the group's references
//! 3. if anything changed, commit and push to the group's target branch
//! 4. run the post-hook with the commit message and changes
//!
//! A rewrite without changes ends the run successfully without committing,
//! pushing, or running the hook.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::{Handler, HandlerError, HandlerReport};
use crate::git::{self, CommitIdentity};
use crate::metrics::Metrics;
use crate::plugin::{HookRunner, ImageRewriter};
use crate::types::TaskGroup;

const COMMIT_TITLE: &str = "chore(kobold): update image refs";

pub struct KoboldHandler {
    rewriter: Arc<dyn ImageRewriter>,
    identity: CommitIdentity,
    metrics: Metrics,
}

impl KoboldHandler {
    pub fn new(rewriter: Arc<dyn ImageRewriter>, identity: CommitIdentity, metrics: Metrics) -> Self {
        KoboldHandler {
            rewriter,
            identity,
            metrics,
        }
    }

    async fn run(
        &self,
        token: &CancellationToken,
        workdir: &Path,
        group: &TaskGroup,
        hooks: &dyn HookRunner,
        warnings: &mut Vec<String>,
    ) -> Result<usize, HandlerError> {
        if token.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }

        git::checkout_detached(workdir, &format!("origin/{}", group.repo_uri.git_ref)).await?;

        if !group.repo_uri.has_safe_pkg() {
            return Err(HandlerError::UnsafePackage(group.repo_uri.pkg.clone()));
        }
        let package_dir = if group.repo_uri.pkg.is_empty() {
            workdir.to_path_buf()
        } else {
            workdir.join(&group.repo_uri.pkg)
        };
        if !package_dir.is_dir() {
            return Err(HandlerError::MissingPackage(package_dir));
        }

        let outcome = self
            .rewriter
            .rewrite(token, &package_dir, &group.msgs)
            .await
            .map_err(HandlerError::Rewrite)?;
        warnings.extend(outcome.warnings);

        if outcome.changes.is_empty() {
            return Ok(0);
        }

        let message = commit_message(&outcome.changes, warnings);
        if !git::commit_all(workdir, &self.identity, &message).await? {
            warn!(fingerprint = %group.fingerprint, "rewriter reported changes but the tree is clean");
            return Ok(0);
        }

        if token.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }

        let target = group.target_branch();
        git::push_head(workdir, &target).await?;
        self.metrics.git_push(&group.repo_uri.repo);
        info!(repo = %group.repo_uri.repo, branch = %target, "pushed image updates");

        hooks
            .run(group, &message, &outcome.changes, warnings)
            .await
            .map_err(HandlerError::Hook)?;

        Ok(outcome.changes.len())
    }
}

#[async_trait]
impl Handler for KoboldHandler {
    #[instrument(skip_all, fields(fingerprint = %group.fingerprint))]
    async fn handle(
        &self,
        token: &CancellationToken,
        workdir: &Path,
        group: &TaskGroup,
        hooks: &dyn HookRunner,
    ) -> HandlerReport {
        let started = Instant::now();
        let mut warnings = Vec::new();

        let result = self.run(token, workdir, group, hooks, &mut warnings).await;

        match &result {
            Ok(changes) => info!(
                changes,
                warnings = warnings.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "pipeline run completed"
            ),
            Err(e) => warn!(
                error = %e,
                warnings = warnings.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "pipeline run failed"
            ),
        }

        HandlerReport {
            warnings,
            result: result.map(|_| ()),
        }
    }
}

/// Title, then one bullet per change, then one bullet per warning.
pub fn commit_message(changes: &[String], warnings: &[String]) -> String {
    let mut msg = String::from(COMMIT_TITLE);
    msg.push('\n');
    for change in changes {
        msg.push_str("\n- ");
        msg.push_str(change);
    }
    if !warnings.is_empty() {
        msg.push('\n');
        for warning in warnings {
            msg.push_str("\n- ");
            msg.push_str(warning);
        }
    }
    msg.push('\n');
    msg
}

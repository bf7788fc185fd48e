//! Tasks, task groups and the status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::ids::{Fingerprint, TaskId};
use super::uri::PackageUri;

/// Lifecycle status of a task.
///
/// ```text
/// pending ──► running ──► success
///                    └──► failure
/// ```
///
/// `success` and `failure` are terminal. Nothing in this crate moves a task
/// out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl TaskStatus {
    /// Returns true for `success` and `failure`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    /// Returns true if a task in status `self` may move to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Success)
                | (TaskStatus::Running, TaskStatus::Failure)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown task status: {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failure" => Ok(TaskStatus::Failure),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One decoded unit of inbound work, bound to a single pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Decoded image references, in the order the decoder produced them.
    pub messages: Vec<String>,
    pub repo_uri: PackageUri,
    pub dest_branch: Option<String>,
    pub post_hook_name: Option<String>,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub failure_reason: Option<String>,
    /// Set when the task is claimed as part of a group.
    pub task_group_fingerprint: Option<Fingerprint>,
}

/// A named post-hook script attached to a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostHook {
    pub name: String,
    pub script: String,
}

/// Pending tasks that share a repository, destination branch and post-hook.
///
/// A group is a snapshot: its member ids are frozen when the fingerprint is
/// computed. Tasks arriving later form a new group on a later dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub fingerprint: Fingerprint,
    pub repo_uri: PackageUri,
    pub dest_branch: Option<String>,
    pub post_hook: Option<PostHook>,
    /// Member ids, sorted.
    pub task_ids: Vec<TaskId>,
    /// Concatenated messages of all members, oldest task first.
    pub msgs: Vec<String>,
}

impl TaskGroup {
    /// The branch changes for this group are pushed to.
    ///
    /// With a destination branch the full fingerprint is appended, so every
    /// group gets its own review branch. Without one, changes go straight to
    /// the source ref.
    pub fn target_branch(&self) -> String {
        match &self.dest_branch {
            Some(dest) => format!("{}-{}", dest, self.fingerprint),
            None => self.repo_uri.git_ref.clone(),
        }
    }
}

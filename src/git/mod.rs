//! Local git operations.
//!
//! Everything shells out to the `git` binary through [`git_command`], which
//! isolates the process from system and user configuration and disables
//! prompts. Commits pass their identity with `-c` flags so nothing depends on
//! per-repository config.
//!
//! - [`cache`]: canonical shallow clones and per-caller copies
//! - free functions: init, shallow fetch, checkout, commit, push

pub mod cache;

use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

pub use cache::{CacheError, RepoCache};

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// Git command failed.
    #[error("git command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// Push was rejected by the remote.
    #[error("push rejected: {details}")]
    PushRejected { details: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for git operations.
pub type GitResult<T> = Result<T, GitError>;

/// Identity used for creating commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for CommitIdentity {
    fn default() -> Self {
        CommitIdentity {
            name: "kobold".to_string(),
            email: "kobold@localhost".to_string(),
        }
    }
}

/// Create a git command with a clean environment (no system/user config).
pub(crate) fn git_command(workdir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(workdir);

    cmd.env("GIT_CONFIG_NOSYSTEM", "1");
    cmd.env("GIT_CONFIG_GLOBAL", "/dev/null");
    cmd.env("GIT_TERMINAL_PROMPT", "0");

    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);
    cmd
}

/// Run git in `workdir` and return trimmed stdout.
pub async fn run_git(workdir: &Path, args: &[&str]) -> GitResult<String> {
    let output = git_command(workdir).args(args).output().await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(GitError::CommandFailed {
            command: format!("git {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Creates an empty repository at `dir` with `url` as `origin`.
pub async fn init(dir: &Path, url: &str) -> GitResult<()> {
    tokio::fs::create_dir_all(dir).await?;
    run_git(dir, &["init", "--quiet"]).await?;
    run_git(dir, &["remote", "add", "origin", url]).await?;
    Ok(())
}

/// Restricts `origin` to `refs` and fetches them with depth 1.
///
/// Each ref becomes available as `origin/<ref>`.
pub async fn fetch_shallow(dir: &Path, refs: &[String]) -> GitResult<()> {
    let mut args = vec!["remote", "set-branches", "origin"];
    args.extend(refs.iter().map(String::as_str));
    run_git(dir, &args).await?;

    run_git(dir, &["fetch", "--quiet", "--depth", "1", "origin"]).await?;
    Ok(())
}

/// Checks out `target` in detached HEAD mode.
pub async fn checkout_detached(dir: &Path, target: &str) -> GitResult<()> {
    run_git(dir, &["checkout", "--quiet", "--detach", target]).await?;
    Ok(())
}

/// Stages everything and commits it. Returns false if there was nothing to
/// commit.
pub async fn commit_all(dir: &Path, identity: &CommitIdentity, message: &str) -> GitResult<bool> {
    run_git(dir, &["add", "--all"]).await?;

    let staged = run_git(dir, &["diff", "--cached", "--name-only"]).await?;
    if staged.is_empty() {
        return Ok(false);
    }

    let name = format!("user.name={}", identity.name);
    let email = format!("user.email={}", identity.email);
    run_git(
        dir,
        &["-c", &name, "-c", &email, "commit", "--quiet", "-m", message],
    )
    .await?;
    Ok(true)
}

/// Pushes HEAD to `refs/heads/<branch>` on origin.
pub async fn push_head(dir: &Path, branch: &str) -> GitResult<()> {
    let refspec = format!("HEAD:refs/heads/{}", branch);
    let output = git_command(dir)
        .args(["push", "--quiet", "origin", &refspec])
        .output()
        .await?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if stderr.contains("non-fast-forward") || stderr.contains("rejected") {
        return Err(GitError::PushRejected { details: stderr });
    }
    Err(GitError::CommandFailed {
        command: format!("git push origin {}", refspec),
        stderr,
    })
}

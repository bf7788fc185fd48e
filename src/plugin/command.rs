//! Plugins backed by external commands.
//!
//! Scripts run through `sh -c` with their input on stdin. Output lines are
//! trimmed and blank lines dropped.

use std::io;
use std::path::Path;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{DecoderRunner, HookRunner, ImageRewriter, PluginError, RewriteOutcome, lines};
use crate::types::TaskGroup;

/// Prefix marking a rewriter stderr line as a warning.
const WARNING_PREFIX: &str = "warning:";

fn shell(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

/// Spawns `cmd`, feeds it `input` and collects its output.
///
/// A process that exits without reading stdin is not an error.
async fn run(mut cmd: Command, program: &str, input: &[u8]) -> Result<Output, PluginError> {
    let spawn_err = |source: io::Error| PluginError::Spawn {
        program: program.to_string(),
        source,
    };

    let mut child = cmd.spawn().map_err(spawn_err)?;
    let stdin = child.stdin.take();

    let write = async move {
        if let Some(mut stdin) = stdin {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }
        Ok::<_, io::Error>(())
    };

    let (written, output) = tokio::join!(write, child.wait_with_output());
    let output = output.map_err(spawn_err)?;
    if let Err(e) = written
        && e.kind() != io::ErrorKind::BrokenPipe
    {
        return Err(spawn_err(e));
    }

    if !output.status.success() {
        return Err(PluginError::Failed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

/// Runs the channel's decoder script with the payload on stdin. Each stdout
/// line is an image reference.
#[derive(Debug, Clone, Default)]
pub struct CommandDecoder;

#[async_trait]
impl DecoderRunner for CommandDecoder {
    async fn decode(
        &self,
        token: &CancellationToken,
        channel: &str,
        script: &str,
        payload: &[u8],
    ) -> Result<Vec<String>, PluginError> {
        let mut cmd = shell(script);
        cmd.env("KOBOLD_CHANNEL", channel);

        let what = format!("decoder for {}", channel);
        let output = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(PluginError::Cancelled),
            output = run(cmd, &what, payload) => output?,
        };
        Ok(lines(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Runs a group's post-hook script.
///
/// The changes are written to stdin one per line. The rest of the context
/// is passed in the environment:
///
/// | variable | value |
/// |---|---|
/// | `KOBOLD_REPO` | repository URL |
/// | `KOBOLD_SRC_BRANCH` | ref the changes are based on |
/// | `KOBOLD_DEST_BRANCH` | branch the changes were pushed to |
/// | `KOBOLD_FINGERPRINT` | task group fingerprint |
/// | `KOBOLD_TITLE` | first line of the commit message |
/// | `KOBOLD_BODY` | rest of the commit message |
/// | `KOBOLD_WARNINGS` | warnings, newline separated |
#[derive(Debug, Clone, Default)]
pub struct CommandHookRunner;

#[async_trait]
impl HookRunner for CommandHookRunner {
    async fn run(
        &self,
        group: &TaskGroup,
        message: &str,
        changes: &[String],
        warnings: &[String],
    ) -> Result<(), PluginError> {
        let Some(hook) = &group.post_hook else {
            return Ok(());
        };

        let (title, body) = message.split_once('\n').unwrap_or((message, ""));

        let mut cmd = shell(&hook.script);
        cmd.env("KOBOLD_REPO", &group.repo_uri.repo)
            .env("KOBOLD_SRC_BRANCH", &group.repo_uri.git_ref)
            .env("KOBOLD_DEST_BRANCH", group.target_branch())
            .env("KOBOLD_FINGERPRINT", group.fingerprint.as_str())
            .env("KOBOLD_TITLE", title)
            .env("KOBOLD_BODY", body.trim())
            .env("KOBOLD_WARNINGS", warnings.join("\n"));

        let mut input = changes.join("\n");
        input.push('\n');

        run(cmd, &format!("post hook {}", hook.name), input.as_bytes()).await?;
        debug!(hook = %hook.name, fingerprint = %group.fingerprint, "post hook finished");
        Ok(())
    }
}

/// Runs a configured program inside the package directory.
///
/// The references go to stdin one per line. Every stdout line is reported as
/// a change. Stderr lines starting with `warning:` become warnings; other
/// stderr output is ignored.
#[derive(Debug, Clone)]
pub struct CommandRewriter {
    command: String,
}

impl CommandRewriter {
    pub fn new(command: impl Into<String>) -> Self {
        CommandRewriter {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ImageRewriter for CommandRewriter {
    async fn rewrite(
        &self,
        token: &CancellationToken,
        package_dir: &Path,
        refs: &[String],
    ) -> Result<RewriteOutcome, PluginError> {
        let mut cmd = shell(&self.command);
        cmd.current_dir(package_dir);

        let mut input = refs.join("\n");
        input.push('\n');

        let output = tokio::select! {
            _ = token.cancelled() => return Err(PluginError::Cancelled),
            output = run(cmd, &self.command, input.as_bytes()) => output?,
        };

        let warnings = String::from_utf8_lossy(&output.stderr)
            .lines()
            .filter_map(|l| l.trim().strip_prefix(WARNING_PREFIX))
            .map(|w| w.trim().to_string())
            .collect();

        Ok(RewriteOutcome {
            changes: lines(&String::from_utf8_lossy(&output.stdout)),
            warnings,
        })
    }
}

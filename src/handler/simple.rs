//! Handlers that do not touch the repository.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Handler, HandlerError, HandlerReport};
use crate::plugin::HookRunner;
use crate::types::TaskGroup;

/// Prints every group as pretty JSON on stdout. Useful for dry runs.
#[derive(Debug, Clone, Default)]
pub struct PrintHandler;

#[async_trait]
impl Handler for PrintHandler {
    async fn handle(
        &self,
        _token: &CancellationToken,
        workdir: &Path,
        group: &TaskGroup,
        _hooks: &dyn HookRunner,
    ) -> HandlerReport {
        match serde_json::to_string_pretty(group) {
            Ok(json) => {
                info!(fingerprint = %group.fingerprint, workdir = %workdir.display(), "printing task group");
                println!("{}", json);
                HandlerReport::ok(vec![])
            }
            Err(e) => HandlerReport::failed(vec![], HandlerError::Serialize(e)),
        }
    }
}

/// Fails every group.
#[derive(Debug, Clone, Default)]
pub struct ErrorHandler;

#[async_trait]
impl Handler for ErrorHandler {
    async fn handle(
        &self,
        _token: &CancellationToken,
        _workdir: &Path,
        _group: &TaskGroup,
        _hooks: &dyn HookRunner,
    ) -> HandlerReport {
        HandlerReport::failed(vec![], HandlerError::Thrown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::CommandHookRunner;
    use crate::types::{Fingerprint, PackageUri, TaskId};

    fn group() -> TaskGroup {
        let ids = vec![TaskId::from("a")];
        TaskGroup {
            fingerprint: Fingerprint::of_ids(&ids),
            repo_uri: PackageUri::new("https://example.com/infra", "main", ""),
            dest_branch: None,
            post_hook: None,
            task_ids: ids,
            msgs: vec!["nginx:1.27".to_string()],
        }
    }

    #[tokio::test]
    async fn print_succeeds() {
        let report = PrintHandler
            .handle(&CancellationToken::new(), Path::new("/tmp"), &group(), &CommandHookRunner)
            .await;
        assert!(report.result.is_ok());
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn error_always_fails() {
        let report = ErrorHandler
            .handle(&CancellationToken::new(), Path::new("/tmp"), &group(), &CommandHookRunner)
            .await;
        assert_eq!(report.result.unwrap_err().to_string(), "task handler error");
    }
}

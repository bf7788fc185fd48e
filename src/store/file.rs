//! Journal-backed task store.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::catalog::Catalog;
use super::journal::{Journal, JournalPayload};
use super::table::TaskTable;
use super::{CompSwap, Result, StoreError, TaskStore};
use crate::types::{Task, TaskGroup, TaskId};

/// A [`TaskStore`] that survives restarts.
///
/// Every mutation is planned against the in-memory table, written to the
/// journal and fsynced, and only then applied. A crash between the write and
/// the apply loses nothing: replay applies the event on the next start.
#[derive(Clone)]
pub struct FileTaskStore {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    table: TaskTable,
    journal: Journal,
}

impl FileTaskStore {
    /// Replays the journal at `path` and opens it for appending.
    pub fn open(path: impl AsRef<Path>, catalog: Catalog) -> Result<Self> {
        let path = path.as_ref();
        let mut table = TaskTable::new(catalog)?;

        let (events, next_seq) = Journal::replay(path)?;
        let replayed = events.len();
        for event in events {
            match event.payload {
                JournalPayload::TasksAppended { tasks } => table.insert(tasks),
                JournalPayload::StatusSwapped { swap, ids } => table.apply_swap(&swap, &ids),
            }
        }

        let journal = Journal::open(path, next_seq)?;
        info!(path = %path.display(), replayed, "task journal opened");

        Ok(FileTaskStore {
            inner: Arc::new(Mutex::new(Inner { table, journal })),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn channel_decoder_get(&self, channel: &str) -> Result<Option<String>> {
        self.lock()?.table.channel_decoder(channel)
    }

    async fn tasks_append(&self, messages: &[String], channel: &str) -> Result<Vec<TaskId>> {
        let mut inner = self.lock()?;
        let tasks = inner.table.plan_append(messages, channel, Utc::now())?;
        if tasks.is_empty() {
            return Ok(vec![]);
        }

        let ids = tasks.iter().map(|t| t.id.clone()).collect();
        inner.journal.append(JournalPayload::TasksAppended {
            tasks: tasks.clone(),
        })?;
        inner.table.insert(tasks);
        Ok(ids)
    }

    async fn task_groups_list_pending(&self) -> Result<Vec<TaskGroup>> {
        Ok(self.lock()?.table.pending_groups())
    }

    async fn task_groups_status_comp_swap(&self, swap: &CompSwap) -> Result<Vec<TaskId>> {
        let mut inner = self.lock()?;
        let ids = inner.table.plan_swap(swap)?;
        if ids.is_empty() {
            return Ok(ids);
        }

        inner.journal.append(JournalPayload::StatusSwapped {
            swap: swap.clone(),
            ids: ids.clone(),
        })?;
        inner.table.apply_swap(swap, &ids);
        Ok(ids)
    }

    async fn tasks_list(&self) -> Result<Vec<Task>> {
        Ok(self.lock()?.table.tasks())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::catalog::Pipeline;
    use crate::types::{PackageUri, TaskStatus};
    use tempfile::tempdir;

    fn catalog() -> Catalog {
        Catalog::default()
            .with_channel("images")
            .with_pipeline(Pipeline {
                name: "infra".to_string(),
                repo_uri: PackageUri::new("https://example.com/infra", "main", ""),
                dest_branch: None,
                post_hook: None,
                channels: vec!["images".to_string()],
            })
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");

        let store = FileTaskStore::open(&path, catalog()).unwrap();
        store.tasks_append(&["nginx:1".to_string()], "images").await.unwrap();
        store.tasks_append(&["redis:7".to_string()], "images").await.unwrap();
        let group = store.task_groups_list_pending().await.unwrap().remove(0);
        store
            .task_groups_status_comp_swap(&CompSwap::claim(&group))
            .await
            .unwrap();
        store
            .task_groups_status_comp_swap(&CompSwap::complete(
                &group,
                TaskStatus::Success,
                vec!["no match for redis".to_string()],
                None,
            ))
            .await
            .unwrap();
        let before = store.tasks_list().await.unwrap();
        drop(store);

        let reopened = FileTaskStore::open(&path, catalog()).unwrap();
        let after = reopened.tasks_list().await.unwrap();
        assert_eq!(after, before);
        assert!(after.iter().all(|t| t.status == TaskStatus::Success));
        assert!(reopened.task_groups_list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn running_tasks_stay_running_after_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");

        let store = FileTaskStore::open(&path, catalog()).unwrap();
        store.tasks_append(&["nginx:1".to_string()], "images").await.unwrap();
        let group = store.task_groups_list_pending().await.unwrap().remove(0);
        store
            .task_groups_status_comp_swap(&CompSwap::claim(&group))
            .await
            .unwrap();
        drop(store);

        let reopened = FileTaskStore::open(&path, catalog()).unwrap();
        let tasks = reopened.tasks_list().await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Running);
        assert!(reopened.task_groups_list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_swaps_are_not_journaled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");

        let store = FileTaskStore::open(&path, catalog()).unwrap();
        store.tasks_append(&["nginx:1".to_string()], "images").await.unwrap();
        let group = store.task_groups_list_pending().await.unwrap().remove(0);
        let len = std::fs::metadata(&path).unwrap().len();

        let done = CompSwap::complete(&group, TaskStatus::Success, vec![], None);
        assert!(store.task_groups_status_comp_swap(&done).await.unwrap().is_empty());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);
    }
}

//! Process-local task store.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::catalog::Catalog;
use super::table::TaskTable;
use super::{CompSwap, Result, StoreError, TaskStore};
use crate::types::{Task, TaskGroup, TaskId};

/// A [`TaskStore`] that keeps everything in memory.
///
/// Cloning shares the underlying table.
#[derive(Clone)]
pub struct MemoryTaskStore {
    table: Arc<Mutex<TaskTable>>,
}

impl MemoryTaskStore {
    /// Creates an empty store routing events through `catalog`.
    pub fn new(catalog: Catalog) -> Result<Self> {
        Ok(MemoryTaskStore {
            table: Arc::new(Mutex::new(TaskTable::new(catalog)?)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, TaskTable>> {
        self.table.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn channel_decoder_get(&self, channel: &str) -> Result<Option<String>> {
        self.lock()?.channel_decoder(channel)
    }

    async fn tasks_append(&self, messages: &[String], channel: &str) -> Result<Vec<TaskId>> {
        let mut table = self.lock()?;
        let tasks = table.plan_append(messages, channel, Utc::now())?;
        let ids = tasks.iter().map(|t| t.id.clone()).collect();
        table.insert(tasks);
        Ok(ids)
    }

    async fn task_groups_list_pending(&self) -> Result<Vec<TaskGroup>> {
        Ok(self.lock()?.pending_groups())
    }

    async fn task_groups_status_comp_swap(&self, swap: &CompSwap) -> Result<Vec<TaskId>> {
        let mut table = self.lock()?;
        let ids = table.plan_swap(swap)?;
        table.apply_swap(swap, &ids);
        Ok(ids)
    }

    async fn tasks_list(&self) -> Result<Vec<Task>> {
        Ok(self.lock()?.tasks())
    }
}

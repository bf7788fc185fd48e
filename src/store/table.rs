//! In-memory task table shared by the store implementations.
//!
//! Mutations are split into a read-only planning step and an apply step so
//! the journaled store can write ahead between the two.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::catalog::Catalog;
use super::{CompSwap, Result, StoreError};
use crate::types::{Fingerprint, PackageUri, Task, TaskGroup, TaskId, TaskStatus};

pub(crate) struct TaskTable {
    catalog: Catalog,
    /// Tasks in insertion order.
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
}

/// Grouping key: tasks agreeing on all three are processed as one commit.
type GroupKey = (PackageUri, Option<String>, Option<String>);

impl TaskTable {
    pub(crate) fn new(catalog: Catalog) -> Result<Self> {
        catalog.validate()?;
        Ok(TaskTable {
            catalog,
            tasks: Vec::new(),
            index: HashMap::new(),
        })
    }

    pub(crate) fn channel_decoder(&self, channel: &str) -> Result<Option<String>> {
        let channel = self
            .catalog
            .channel(channel)
            .ok_or_else(|| StoreError::ChannelNotFound(channel.to_string()))?;

        Ok(channel
            .decoder
            .as_deref()
            .and_then(|name| self.catalog.decoder(name))
            .map(|d| d.script.clone()))
    }

    /// Builds one pending task per subscribed pipeline without inserting them.
    pub(crate) fn plan_append(
        &self,
        messages: &[String],
        channel: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        if self.catalog.channel(channel).is_none() {
            return Err(StoreError::ChannelNotFound(channel.to_string()));
        }

        Ok(self
            .catalog
            .subscribers(channel)
            .map(|pipeline| Task {
                id: TaskId::generate(),
                messages: messages.to_vec(),
                repo_uri: pipeline.repo_uri.clone(),
                dest_branch: pipeline.dest_branch.clone(),
                post_hook_name: pipeline.post_hook.clone(),
                status: TaskStatus::Pending,
                timestamp: now,
                warnings: Vec::new(),
                failure_reason: None,
                task_group_fingerprint: None,
            })
            .collect())
    }

    pub(crate) fn insert(&mut self, tasks: Vec<Task>) {
        for task in tasks {
            self.index.insert(task.id.clone(), self.tasks.len());
            self.tasks.push(task);
        }
    }

    pub(crate) fn pending_groups(&self) -> Vec<TaskGroup> {
        let mut order: Vec<GroupKey> = Vec::new();
        let mut members: HashMap<GroupKey, Vec<&Task>> = HashMap::new();

        for task in self.tasks.iter().filter(|t| t.status == TaskStatus::Pending) {
            let key = (
                task.repo_uri.clone(),
                task.dest_branch.clone(),
                task.post_hook_name.clone(),
            );
            let entry = members.entry(key.clone()).or_default();
            if entry.is_empty() {
                order.push(key);
            }
            entry.push(task);
        }

        order
            .into_iter()
            .filter_map(|key| {
                let tasks = members.remove(&key)?;
                let (repo_uri, dest_branch, post_hook_name) = key;

                let mut task_ids: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
                task_ids.sort();
                let msgs = tasks.iter().flat_map(|t| t.messages.iter().cloned()).collect();
                let post_hook = post_hook_name
                    .as_deref()
                    .and_then(|name| self.catalog.post_hook(name))
                    .cloned();

                Some(TaskGroup {
                    fingerprint: Fingerprint::of_ids(&task_ids),
                    repo_uri,
                    dest_branch,
                    post_hook,
                    task_ids,
                    msgs,
                })
            })
            .collect()
    }

    /// Returns the ids a compare-and-swap would change.
    pub(crate) fn plan_swap(&self, swap: &CompSwap) -> Result<Vec<TaskId>> {
        if !swap.required_status.can_transition_to(swap.status) {
            return Err(StoreError::InvalidTransition {
                from: swap.required_status,
                to: swap.status,
            });
        }

        Ok(swap
            .ids
            .iter()
            .filter(|id| {
                self.index
                    .get(*id)
                    .and_then(|&i| self.tasks.get(i))
                    .is_some_and(|t| t.status == swap.required_status)
            })
            .cloned()
            .collect())
    }

    /// Applies a planned swap to exactly `ids`.
    pub(crate) fn apply_swap(&mut self, swap: &CompSwap, ids: &[TaskId]) {
        for id in ids {
            let Some(task) = self.index.get(id).and_then(|&i| self.tasks.get_mut(i)) else {
                continue;
            };
            task.status = swap.status;
            task.task_group_fingerprint = Some(swap.fingerprint.clone());
            task.warnings = swap.warnings.clone();
            task.failure_reason = swap.failure_reason.clone();
        }
    }

    pub(crate) fn tasks(&self) -> Vec<Task> {
        self.tasks.clone()
    }
}

//! In-memory mirror of the schedule store.
//!
//! The cache is authoritative at runtime. Mutations go through the store
//! first and only land in the map once the store write succeeded, so after a
//! crash the store holds everything that was ever committed.
//!
//! The lock is held across store I/O (bounded by local disk latency) but
//! never across an `.await`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use millwright_core::error::{MillwrightError, Result};

use crate::store::ScheduleStore;
use crate::tasks::ScheduledTask;

#[derive(Debug, Default)]
pub struct ScheduleCache {
    tasks: Mutex<HashMap<String, ScheduledTask>>,
}

impl ScheduleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate from a store snapshot, replacing whatever was cached.
    pub fn load(&self, tasks: Vec<ScheduledTask>) {
        let mut map = self.lock();
        map.clear();
        for task in tasks {
            map.insert(task.task_id.clone(), task);
        }
        tracing::debug!("Cache loaded with {} tasks", map.len());
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ScheduledTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, task_id: &str) -> Option<ScheduledTask> {
        self.lock().get(task_id).cloned()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of every cached task. The lock is released before returning.
    pub fn snapshot(&self) -> Vec<ScheduledTask> {
        self.lock().values().cloned().collect()
    }

    /// Store-create then cache-insert, atomically with respect to other mutations.
    pub fn insert_through(&self, store: &dyn ScheduleStore, task: ScheduledTask) -> Result<()> {
        let mut map = self.lock();
        if map.contains_key(&task.task_id) {
            return Err(MillwrightError::validation(format!(
                "task {} already exists",
                task.task_id
            )));
        }
        store.create(&task)?;
        map.insert(task.task_id.clone(), task);
        Ok(())
    }

    /// Read-modify-write one task. `mutate` works on a copy; the copy is written
    /// to the store and then replaces the cached entry. Nothing changes if
    /// `mutate` or the store write fails.
    pub fn update_through<F>(
        &self,
        store: &dyn ScheduleStore,
        task_id: &str,
        mutate: F,
    ) -> Result<ScheduledTask>
    where
        F: FnOnce(&mut ScheduledTask) -> Result<()>,
    {
        let mut map = self.lock();
        let current = map
            .get(task_id)
            .ok_or_else(|| MillwrightError::NotFound(task_id.to_string()))?;
        let mut updated = current.clone();
        mutate(&mut updated)?;
        if updated != *current {
            store.update(&updated)?;
            map.insert(task_id.to_string(), updated.clone());
        }
        Ok(updated)
    }

    /// Cache-delete then store-delete. A failed store delete puts the entry back.
    /// Returns the removed task, `None` if it was not cached.
    pub fn remove_through(
        &self,
        store: &dyn ScheduleStore,
        task_id: &str,
    ) -> Result<Option<ScheduledTask>> {
        let mut map = self.lock();
        let Some(removed) = map.remove(task_id) else {
            // Not cached: make sure no stale row survives either.
            store.delete(task_id)?;
            return Ok(None);
        };
        if let Err(e) = store.delete(task_id) {
            map.insert(task_id.to_string(), removed);
            return Err(e);
        }
        Ok(Some(removed))
    }
}

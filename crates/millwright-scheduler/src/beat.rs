//! Beat synchronisation. Keeps the broker's periodic table in step with the
//! recurring tasks in the cache.
//!
//! A recurring task is installed iff it is enabled. One-shot tasks never are.
//! The synchroniser remembers what it last installed per task, so re-syncing an
//! unchanged task costs no broker call. Writes the broker rejected stay pending
//! and are retried on every engine tick.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use millwright_core::error::Result;

use crate::broker::Broker;
use crate::cache::ScheduleCache;
use crate::router::{Queue, QueueRouter, RetryPolicy};
use crate::tasks::{ScheduleKind, ScheduledTask, TaskStatus};

/// Schedule in the broker's own terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleExpression {
    /// Classic 5-field crontab text.
    Crontab { expression: String },
    Interval { seconds: u64 },
}

/// One row of the broker's periodic table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicEntry {
    pub job_name: String,
    pub schedule: ScheduleExpression,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub queue: Queue,
    pub retry_policy: RetryPolicy,
    pub expires_at: Option<DateTime<Utc>>,
    pub soft_time_limit_secs: Option<u64>,
    pub rate_limit: Option<String>,
}

impl PeriodicEntry {
    /// Entry for a recurring task; `None` for one-shot tasks.
    pub fn for_task(task: &ScheduledTask, router: &QueueRouter) -> Option<Self> {
        let schedule = match &task.schedule {
            ScheduleKind::Cron(spec) => ScheduleExpression::Crontab {
                expression: spec.expression(),
            },
            ScheduleKind::Interval { seconds } => ScheduleExpression::Interval {
                seconds: *seconds,
            },
            ScheduleKind::Once { .. } => return None,
        };
        Some(Self {
            job_name: task.job_name.clone(),
            schedule,
            args: task.args.clone(),
            kwargs: task.kwargs.clone(),
            queue: QueueRouter::route(task.priority),
            retry_policy: router.retry_policy_for(task),
            expires_at: task.expires_at,
            soft_time_limit_secs: task.timeout_seconds,
            rate_limit: router.rate_limit(&task.job_name).map(|l| l.to_string()),
        })
    }
}

/// The entry a task should have in the periodic table right now.
fn desired_entry(task: &ScheduledTask, router: &QueueRouter) -> Option<PeriodicEntry> {
    if !task.enabled || task.status != TaskStatus::Scheduled {
        return None;
    }
    PeriodicEntry::for_task(task, router)
}

#[derive(Debug, Default)]
struct BeatState {
    /// Last entry installed per task.
    installed: HashMap<String, PeriodicEntry>,
    /// Tasks whose last broker write failed. Retried until it goes through.
    pending: BTreeSet<String>,
}

pub struct BeatSynchronizer {
    broker: Arc<dyn Broker>,
    router: Arc<QueueRouter>,
    cache: Arc<ScheduleCache>,
    /// Also serialises all beat traffic.
    state: Mutex<BeatState>,
}

impl BeatSynchronizer {
    pub fn new(
        broker: Arc<dyn Broker>,
        router: Arc<QueueRouter>,
        cache: Arc<ScheduleCache>,
    ) -> Self {
        Self {
            broker,
            router,
            cache,
            state: Mutex::new(BeatState::default()),
        }
    }

    /// Install the task's entry unconditionally. No-op for one-shot tasks.
    pub async fn register(&self, task: &ScheduledTask) -> Result<()> {
        let Some(entry) = PeriodicEntry::for_task(task, &self.router) else {
            return Ok(());
        };
        let mut state = self.state.lock().await;
        if let Err(e) = self.broker.set_periodic(&task.task_id, entry.clone()).await {
            state.pending.insert(task.task_id.clone());
            return Err(e);
        }
        state.installed.insert(task.task_id.clone(), entry);
        state.pending.remove(&task.task_id);
        tracing::info!("🫀 Beat entry registered: {} ({})", task.task_id, task.job_name);
        Ok(())
    }

    /// Remove the task's entry. Removing an absent key is a no-op at the broker.
    pub async fn unregister(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Err(e) = self.broker.remove_periodic(task_id).await {
            state.pending.insert(task_id.to_string());
            return Err(e);
        }
        state.pending.remove(task_id);
        if state.installed.remove(task_id).is_some() {
            tracing::info!("🫀 Beat entry removed: {}", task_id);
        }
        Ok(())
    }

    /// Bring the broker in line with the task as it stands in the cache now.
    /// A task missing from the cache is treated as removed.
    /// Returns `true` if the broker was called.
    pub async fn sync(&self, task_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        self.reconcile(&mut state, task_id).await
    }

    /// Retry every task whose last broker write failed.
    /// Returns how many are still pending afterwards.
    pub async fn retry_pending(&self) -> usize {
        let mut state = self.state.lock().await;
        let pending: Vec<String> = state.pending.iter().cloned().collect();
        for task_id in pending {
            match self.reconcile(&mut state, &task_id).await {
                Ok(_) => tracing::info!("🫀 Beat entry repaired: {}", task_id),
                Err(e) => tracing::debug!("Beat retry for {} failed again: {}", task_id, e),
            }
        }
        state.pending.len()
    }

    /// Caller holds the state lock, so the cache read and the broker write
    /// cannot interleave with another sync of the same task.
    async fn reconcile(&self, state: &mut BeatState, task_id: &str) -> Result<bool> {
        let desired = self
            .cache
            .get(task_id)
            .and_then(|task| desired_entry(&task, &self.router));
        let retrying = state.pending.contains(task_id);
        if !retrying && desired.as_ref() == state.installed.get(task_id) {
            return Ok(false);
        }

        let written = match desired {
            Some(entry) => {
                let result = self.broker.set_periodic(task_id, entry.clone()).await;
                if result.is_ok() {
                    tracing::info!("🫀 Beat entry synced: {} ({})", task_id, entry.job_name);
                    state.installed.insert(task_id.to_string(), entry);
                }
                result
            }
            None => {
                let result = self.broker.remove_periodic(task_id).await;
                if result.is_ok() && state.installed.remove(task_id).is_some() {
                    tracing::info!("🫀 Beat entry removed: {}", task_id);
                }
                result
            }
        };

        match written {
            Ok(()) => {
                state.pending.remove(task_id);
                Ok(true)
            }
            Err(e) => {
                state.pending.insert(task_id.to_string());
                Err(e)
            }
        }
    }

    /// Full reconciliation against the cache: install every enabled recurring
    /// task and drop broker entries that no longer correspond to one. Entries
    /// that fail are left pending for [`retry_pending`](Self::retry_pending).
    pub async fn resync_all(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let wanted: BTreeMap<String, PeriodicEntry> = self
            .cache
            .snapshot()
            .iter()
            .filter_map(|t| desired_entry(t, &self.router).map(|e| (t.task_id.clone(), e)))
            .collect();

        let existing: BTreeSet<String> = match self.broker.periodic_task_ids().await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                state.pending.extend(wanted.keys().cloned());
                return Err(e);
            }
        };

        let mut first_error = None;
        for stale in existing.iter().filter(|id| !wanted.contains_key(id.as_str())) {
            match self.broker.remove_periodic(stale).await {
                Ok(()) => {
                    state.installed.remove(stale);
                    state.pending.remove(stale);
                    tracing::info!("🫀 Stale beat entry dropped: {}", stale);
                }
                Err(e) => {
                    state.pending.insert(stale.clone());
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        for (task_id, entry) in &wanted {
            match self.broker.set_periodic(task_id, entry.clone()).await {
                Ok(()) => {
                    state.installed.insert(task_id.clone(), entry.clone());
                    state.pending.remove(task_id);
                }
                Err(e) => {
                    state.pending.insert(task_id.clone());
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        tracing::info!(
            "🫀 Beat table reconciled: {} wanted, {} previously present, {} pending",
            wanted.len(),
            existing.len(),
            state.pending.len()
        );
        first_error.map_or(Ok(()), Err)
    }

    /// Task IDs this synchroniser believes are installed.
    pub async fn installed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().await.installed.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Task IDs waiting for a broker retry.
    pub async fn pending_ids(&self) -> Vec<String> {
        self.state.lock().await.pending.iter().cloned().collect()
    }
}

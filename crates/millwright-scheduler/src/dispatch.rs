//! Dispatch: hands one execution of a scheduled task to the broker and
//! writes the bookkeeping back.
//!
//! The cache lock is never held while the broker call is in flight: the task is
//! copied out, the lock released, the broker awaited, and the lock re-taken
//! briefly for the write-back.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use millwright_core::error::{MillwrightError, Result};

use crate::broker::{Broker, DispatchRequest, TaskHandle};
use crate::cache::ScheduleCache;
use crate::calculator::NextRunCalculator;
use crate::router::QueueRouter;
use crate::store::ScheduleStore;
use crate::tasks::{ScheduledTask, TaskStatus};

/// Result of one `execute_now` call. Every negative case is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Dispatched(TaskHandle),
    NotFound,
    /// Task is disabled and the call was not forced.
    Disabled,
    /// `expires_at` has passed.
    Expired,
    /// The job's rate limit is exhausted for the current window.
    RateLimited,
    /// Broker rejected or could not be reached. `failure_count` was bumped.
    Failed(String),
}

impl DispatchOutcome {
    pub fn handle(&self) -> Option<&TaskHandle> {
        match self {
            DispatchOutcome::Dispatched(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn is_dispatched(&self) -> bool {
        matches!(self, DispatchOutcome::Dispatched(_))
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchOutcome::Dispatched(handle) => write!(f, "dispatched ({handle})"),
            DispatchOutcome::NotFound => f.write_str("not found"),
            DispatchOutcome::Disabled => f.write_str("disabled"),
            DispatchOutcome::Expired => f.write_str("expired"),
            DispatchOutcome::RateLimited => f.write_str("rate limited"),
            DispatchOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

pub struct Dispatcher {
    cache: Arc<ScheduleCache>,
    store: Arc<dyn ScheduleStore>,
    broker: Arc<dyn Broker>,
    router: Arc<QueueRouter>,
    calculator: NextRunCalculator,
}

impl Dispatcher {
    pub fn new(
        cache: Arc<ScheduleCache>,
        store: Arc<dyn ScheduleStore>,
        broker: Arc<dyn Broker>,
        router: Arc<QueueRouter>,
        calculator: NextRunCalculator,
    ) -> Self {
        Self {
            cache,
            store,
            broker,
            router,
            calculator,
        }
    }

    pub async fn execute_now(&self, task_id: &str, force: bool) -> DispatchOutcome {
        self.execute_at(task_id, force, Utc::now()).await
    }

    /// Dispatch `task_id` as of `now`.
    pub async fn execute_at(
        &self,
        task_id: &str,
        force: bool,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        let Some(task) = self.cache.get(task_id) else {
            tracing::debug!("Dispatch skipped, unknown task {}", task_id);
            return DispatchOutcome::NotFound;
        };

        if !task.enabled && !force {
            tracing::debug!("Dispatch skipped, task {} is disabled", task_id);
            return DispatchOutcome::Disabled;
        }

        if task.is_expired(now) {
            tracing::warn!(
                "⌛ Task {} ({}) expired at {:?}, not dispatching",
                task_id,
                task.job_name,
                task.expires_at
            );
            if !task.is_recurring() && task.status == TaskStatus::Scheduled {
                self.mark_expired(task_id);
            }
            return DispatchOutcome::Expired;
        }

        if !self.router.try_acquire(&task.job_name, now) {
            tracing::warn!("🚦 Task {} ({}) rate limited", task_id, task.job_name);
            return DispatchOutcome::RateLimited;
        }

        let request = self.request_for(&task);
        let queue = request.queue;

        match self.broker.send(request).await {
            Ok(handle) => {
                self.router.record_dispatch(queue);
                tracing::info!(
                    "🚀 Dispatched {} ({}) → queue '{}' as {}",
                    task_id,
                    task.job_name,
                    queue,
                    handle
                );
                if let Err(e) = self.record_success(task_id, now) {
                    // The job is already enqueued; only the bookkeeping is lost.
                    tracing::error!("❌ Failed to record dispatch of {}: {}", task_id, e);
                }
                DispatchOutcome::Dispatched(handle)
            }
            Err(e) => {
                tracing::error!("❌ Dispatch of {} ({}) failed: {}", task_id, task.job_name, e);
                self.router.release(&task.job_name, now);
                if let Err(store_err) = self.record_failure(task_id) {
                    tracing::error!("❌ Failed to record failure of {}: {}", task_id, store_err);
                }
                DispatchOutcome::Failed(e.to_string())
            }
        }
    }

    /// Revoke an execution previously returned by a dispatch.
    pub async fn revoke(&self, handle: &TaskHandle, terminate: bool) -> Result<()> {
        self.broker.revoke(handle, terminate).await?;
        tracing::info!("🛑 Revoked {} (terminate={})", handle, terminate);
        Ok(())
    }

    fn request_for(&self, task: &ScheduledTask) -> DispatchRequest {
        DispatchRequest {
            task_id: task.task_id.clone(),
            job_name: task.job_name.clone(),
            args: task.args.clone(),
            kwargs: task.kwargs.clone(),
            queue: QueueRouter::route(task.priority),
            retry_policy: self.router.retry_policy_for(task),
            countdown_secs: 0,
            expires: task.expires_at,
            soft_time_limit_secs: task.timeout_seconds,
            rate_limit: self.router.rate_limit(&task.job_name).map(|l| l.to_string()),
        }
    }

    fn record_success(&self, task_id: &str, now: DateTime<Utc>) -> Result<ScheduledTask> {
        let calculator = self.calculator;
        self.cache.update_through(self.store.as_ref(), task_id, |task| {
            task.next_run_at = calculator.after_dispatch(task, now);
            task.last_run_at = Some(now);
            task.run_count = task.run_count.saturating_add(1);
            if !task.is_recurring() {
                task.status = TaskStatus::Completed;
            }
            Ok(())
        })
    }

    fn record_failure(&self, task_id: &str) -> Result<ScheduledTask> {
        self.cache.update_through(self.store.as_ref(), task_id, |task| {
            task.failure_count = task.failure_count.saturating_add(1);
            Ok(())
        })
    }

    fn mark_expired(&self, task_id: &str) {
        let result = self.cache.update_through(self.store.as_ref(), task_id, |task| {
            task.status = TaskStatus::Expired;
            task.next_run_at = None;
            Ok(())
        });
        match result {
            Ok(_) => tracing::info!("⌛ Task {} moved to expired", task_id),
            Err(MillwrightError::NotFound(_)) => {}
            Err(e) => tracing::warn!("⚠️ Could not mark {} expired: {}", task_id, e),
        }
    }
}

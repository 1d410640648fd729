//! The scheduler facade: one explicit object owning store, cache, router,
//! beat synchroniser and dispatcher. Construct it once and share it by `Arc`.
//!
//! Data mutations are authoritative once the store write succeeds. Beat
//! synchronisation runs afterwards against the cache's current state. Its
//! failures are logged and retried on every engine tick.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use millwright_core::config::{IntervalAnchor, MillwrightConfig};
use millwright_core::error::{MillwrightError, Result};

use crate::beat::BeatSynchronizer;
use crate::broker::{Broker, TaskHandle};
use crate::cache::ScheduleCache;
use crate::calculator::NextRunCalculator;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::maintenance::{MaintenanceCalendar, MaintenanceWindow};
use crate::router::{QueueRouter, RateLimit, RetryPolicy};
use crate::stats::TaskStatistics;
use crate::store::{ScheduleStore, SqliteStore};
use crate::tasks::{
    NewTask, PatchEffect, Priority, ScheduleKind, ScheduledTask, TaskIdGenerator, TaskPatch,
    TaskStatus,
};

/// Runtime knobs, usually derived from [`MillwrightConfig`].
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval_anchor: IntervalAnchor,
    pub check_interval: Duration,
    /// Hold low-priority one-shot tasks until a maintenance window is open.
    pub defer_low_priority_to_maintenance: bool,
    pub retry: RetryPolicy,
    pub rate_limits: HashMap<String, RateLimit>,
    /// Windows to persist at startup. Empty means "use what the store has".
    pub maintenance_windows: Vec<MaintenanceWindow>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval_anchor: IntervalAnchor::default(),
            check_interval: Duration::from_secs(30),
            defer_low_priority_to_maintenance: false,
            retry: RetryPolicy::default(),
            rate_limits: HashMap::new(),
            maintenance_windows: Vec::new(),
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &MillwrightConfig) -> Result<Self> {
        let rate_limits = config
            .rate_limits
            .iter()
            .map(|(job, limit)| Ok((job.clone(), limit.parse::<RateLimit>()?)))
            .collect::<Result<HashMap<_, _>>>()?;
        let maintenance_windows = config
            .maintenance_windows
            .iter()
            .map(MaintenanceWindow::from_config)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            interval_anchor: config.scheduler.interval_anchor,
            check_interval: Duration::from_secs(config.scheduler.check_interval_secs),
            defer_low_priority_to_maintenance: config.scheduler.defer_low_priority_to_maintenance,
            retry: RetryPolicy::from(&config.retry),
            rate_limits,
            maintenance_windows,
        })
    }
}

pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    cache: Arc<ScheduleCache>,
    router: Arc<QueueRouter>,
    beat: BeatSynchronizer,
    dispatcher: Dispatcher,
    calculator: NextRunCalculator,
    calendar: RwLock<MaintenanceCalendar>,
    ids: TaskIdGenerator,
    check_interval: Duration,
    defer_low_priority: bool,
}

impl Scheduler {
    /// Open the SQLite store named in `config` and start up against `broker`.
    pub async fn open(config: &MillwrightConfig, broker: Arc<dyn Broker>) -> Result<Self> {
        let path = config.scheduler.expanded_db_path();
        let store = Arc::new(SqliteStore::open(&path)?);
        Self::new(store, broker, SchedulerSettings::from_config(config)?).await
    }

    /// Load the cache from `store`, bring stale next-run times forward and
    /// reconcile the broker's beat table.
    pub async fn new(
        store: Arc<dyn ScheduleStore>,
        broker: Arc<dyn Broker>,
        settings: SchedulerSettings,
    ) -> Result<Self> {
        let windows = if settings.maintenance_windows.is_empty() {
            store.load_windows()?
        } else {
            store.save_windows(&settings.maintenance_windows)?;
            settings.maintenance_windows.clone()
        };

        let cache = Arc::new(ScheduleCache::new());
        cache.load(store.load_all()?);

        let router = Arc::new(QueueRouter::new(
            settings.retry.clone(),
            settings.rate_limits.clone(),
        ));
        let calculator = NextRunCalculator::new(settings.interval_anchor);
        let beat = BeatSynchronizer::new(broker.clone(), router.clone(), cache.clone());
        let dispatcher = Dispatcher::new(
            cache.clone(),
            store.clone(),
            broker,
            router.clone(),
            calculator,
        );

        let scheduler = Self {
            store,
            cache,
            router,
            beat,
            dispatcher,
            calculator,
            calendar: RwLock::new(MaintenanceCalendar::new(windows)),
            ids: TaskIdGenerator::new(),
            check_interval: settings.check_interval,
            defer_low_priority: settings.defer_low_priority_to_maintenance,
        };

        scheduler.refresh_stale(Utc::now());
        if let Err(e) = scheduler.beat.resync_all().await {
            tracing::warn!("⚠️ Beat resync failed at startup: {}", e);
        }

        tracing::info!(
            "⏰ Scheduler ready: {} tasks, {} maintenance windows",
            scheduler.cache.len(),
            scheduler.calendar().windows().len()
        );
        Ok(scheduler)
    }

    /// Recurring tasks whose next run is missing or already past get a fresh
    /// one. One-shot tasks that expired while we were down are retired.
    fn refresh_stale(&self, now: DateTime<Utc>) {
        for task in self.cache.snapshot() {
            if task.status != TaskStatus::Scheduled {
                continue;
            }
            let result = if task.is_recurring() {
                if task.next_run_at.is_some_and(|next| next > now) {
                    continue;
                }
                let calculator = self.calculator;
                self.cache.update_through(self.store.as_ref(), &task.task_id, |t| {
                    t.next_run_at = calculator.next_run_from(&t.schedule, t.next_run_at, now);
                    Ok(())
                })
            } else if task.is_expired(now) {
                self.cache.update_through(self.store.as_ref(), &task.task_id, |t| {
                    t.status = TaskStatus::Expired;
                    t.next_run_at = None;
                    Ok(())
                })
            } else {
                continue;
            };
            match result {
                Ok(t) => tracing::debug!("Refreshed {}: next run {:?}", t.task_id, t.next_run_at),
                Err(e) => tracing::warn!("⚠️ Could not refresh {}: {}", task.task_id, e),
            }
        }
    }

    fn calendar(&self) -> RwLockReadGuard<'_, MaintenanceCalendar> {
        self.calendar.read().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Task lifecycle ───────────────────────────────────────

    pub async fn add_task(&self, new: NewTask) -> Result<ScheduledTask> {
        self.add_task_at(new, Utc::now()).await
    }

    /// Validate, persist, cache, then register with beat if recurring and enabled.
    pub async fn add_task_at(&self, new: NewTask, now: DateTime<Utc>) -> Result<ScheduledTask> {
        if let Err(e) = new.validate(now) {
            tracing::warn!("⚠️ Rejected task '{}': {}", new.job_name, e);
            return Err(e);
        }

        let task = ScheduledTask {
            task_id: self.ids.next_id(now),
            job_name: new.job_name,
            next_run_at: self.calculator.next_run(&new.schedule, now),
            schedule: new.schedule,
            args: new.args,
            kwargs: new.kwargs,
            priority: new.priority,
            enabled: new.enabled,
            status: TaskStatus::Scheduled,
            created_at: now,
            last_run_at: None,
            run_count: 0,
            failure_count: 0,
            max_retries: new.max_retries.unwrap_or(self.router.default_retry().max_retries),
            timeout_seconds: new.timeout_seconds,
            expires_at: new.expires_at,
            metadata: new.metadata,
        };

        if let Err(e) = self.cache.insert_through(self.store.as_ref(), task.clone()) {
            tracing::error!("❌ Failed to store task '{}': {}", task.job_name, e);
            return Err(e);
        }
        tracing::info!(
            "📅 Scheduled {} '{}' ({}, {} priority, next run {:?})",
            task.task_id,
            task.job_name,
            task.schedule.label(),
            task.priority,
            task.next_run_at
        );

        self.sync_beat(&task.task_id).await;
        Ok(task)
    }

    pub async fn update_task(&self, task_id: &str, patch: TaskPatch) -> Result<ScheduledTask> {
        self.update_task_at(task_id, patch, Utc::now()).await
    }

    /// Apply `patch`. A changed schedule, enabled flag or status recomputes
    /// `next_run_at`. A new schedule re-arms a finished task.
    pub async fn update_task_at(
        &self,
        task_id: &str,
        patch: TaskPatch,
        now: DateTime<Utc>,
    ) -> Result<ScheduledTask> {
        patch.validate(now)?;

        let calculator = self.calculator;
        let mut effect = PatchEffect::default();
        let updated = self
            .cache
            .update_through(self.store.as_ref(), task_id, |task| {
                effect = patch.apply(task);
                let rearmed = task.rearm(effect, now);
                if effect.schedule_changed || effect.enabled_changed || rearmed {
                    task.next_run_at = calculator.for_task(task, now);
                }
                Ok(())
            })
            .inspect_err(|e| {
                if !matches!(e, MillwrightError::NotFound(_)) {
                    tracing::error!("❌ Failed to update {}: {}", task_id, e);
                }
            })?;

        if effect.changed() {
            tracing::info!(
                "✏️ Updated {} (schedule changed: {}, enabled changed: {}, status {})",
                task_id,
                effect.schedule_changed,
                effect.enabled_changed,
                updated.status.as_str()
            );
            self.sync_beat(task_id).await;
        }
        Ok(updated)
    }

    /// Remove a task. Unknown IDs are a no-op returning `false`.
    pub async fn remove_task(&self, task_id: &str) -> Result<bool> {
        let removed = match self.cache.remove_through(self.store.as_ref(), task_id) {
            Ok(removed) => removed,
            Err(e) => {
                tracing::error!("❌ Failed to remove {}: {}", task_id, e);
                return Err(e);
            }
        };
        if let Err(e) = self.beat.unregister(task_id).await {
            tracing::warn!("⚠️ Beat unregister failed for {}: {}", task_id, e);
        }
        match &removed {
            Some(task) => tracing::info!("🗑️ Removed {} '{}'", task_id, task.job_name),
            None => tracing::debug!("Remove of unknown task {} ignored", task_id),
        }
        Ok(removed.is_some())
    }

    pub fn get_task(&self, task_id: &str) -> Option<ScheduledTask> {
        self.cache.get(task_id)
    }

    /// All tasks, oldest first.
    pub fn list_tasks(&self, enabled_only: bool) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self
            .cache
            .snapshot()
            .into_iter()
            .filter(|t| !enabled_only || t.enabled)
            .collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        tasks
    }

    pub async fn enable_task(&self, task_id: &str) -> Result<ScheduledTask> {
        self.update_task(task_id, TaskPatch::new().enabled(true)).await
    }

    pub async fn disable_task(&self, task_id: &str) -> Result<ScheduledTask> {
        self.update_task(task_id, TaskPatch::new().enabled(false)).await
    }

    async fn sync_beat(&self, task_id: &str) {
        if let Err(e) = self.beat.sync(task_id).await {
            tracing::warn!("⚠️ Beat sync failed for {}, will retry: {}", task_id, e);
        }
    }

    /// Retry beat writes the broker rejected earlier. Returns how many are
    /// still outstanding.
    pub async fn retry_beat(&self) -> usize {
        let pending = self.beat.retry_pending().await;
        if pending > 0 {
            tracing::warn!("⚠️ {} beat entries still out of sync", pending);
        }
        pending
    }

    // ─── Dispatch ───────────────────────────────────────

    pub async fn execute_now(&self, task_id: &str, force: bool) -> DispatchOutcome {
        self.dispatcher.execute_now(task_id, force).await
    }

    pub async fn execute_at(
        &self,
        task_id: &str,
        force: bool,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        self.dispatcher.execute_at(task_id, force, now).await
    }

    pub async fn revoke(&self, handle: &TaskHandle, terminate: bool) -> Result<()> {
        self.dispatcher.revoke(handle, terminate).await
    }

    /// One-shot tasks due at `now`, earliest first. With deferral on, low
    /// priority ones wait for an open maintenance window.
    pub fn due_one_shots(&self, now: DateTime<Utc>) -> Vec<String> {
        let in_window = self.calendar().in_window(now);
        let mut due: Vec<ScheduledTask> = self
            .cache
            .snapshot()
            .into_iter()
            .filter(|t| t.is_due_once(now))
            .filter(|t| {
                let hold = self.defer_low_priority && t.priority == Priority::Low && !in_window;
                if hold {
                    tracing::debug!("Holding {} until the next maintenance window", t.task_id);
                }
                !hold
            })
            .collect();
        due.sort_by_key(|t| t.next_run_at);
        due.into_iter().map(|t| t.task_id).collect()
    }

    /// Dispatch every due one-shot task. Recurring tasks fire from the broker's beat.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Vec<(String, DispatchOutcome)> {
        let mut results = Vec::new();
        for task_id in self.due_one_shots(now) {
            let outcome = self.dispatcher.execute_at(&task_id, false, now).await;
            results.push((task_id, outcome));
        }
        results
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    // ─── Statistics & maintenance ───────────────────────────────────────

    pub fn statistics(&self) -> TaskStatistics {
        self.statistics_at(Utc::now())
    }

    pub fn statistics_at(&self, now: DateTime<Utc>) -> TaskStatistics {
        let tasks = self.cache.snapshot();
        TaskStatistics::collect(&tasks, &self.calendar(), self.router.stats(), now)
    }

    /// Whether `t` (default: now) falls inside any maintenance window.
    pub fn is_maintenance_window(&self, t: Option<DateTime<Utc>>) -> bool {
        self.calendar().in_window(t.unwrap_or_else(Utc::now))
    }

    /// Next window start after `after` (default: now), within a week.
    pub fn next_maintenance_time(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        self.calendar().next_window_start(after.unwrap_or_else(Utc::now))
    }

    pub fn maintenance_windows(&self) -> Vec<MaintenanceWindow> {
        self.calendar().windows().to_vec()
    }

    /// Persist and activate a new window set.
    pub fn set_maintenance_windows(&self, windows: Vec<MaintenanceWindow>) -> Result<()> {
        self.store.save_windows(&windows)?;
        let count = windows.len();
        let mut calendar = self.calendar.write().unwrap_or_else(|e| e.into_inner());
        *calendar = MaintenanceCalendar::new(windows);
        drop(calendar);
        tracing::info!("🛠️ Maintenance windows updated ({})", count);
        Ok(())
    }

    // ─── Convenience constructors ───────────────────────────────────────

    /// Every day at `hour:minute` UTC.
    pub async fn schedule_daily(
        &self,
        job_name: &str,
        hour: u32,
        minute: u32,
        args: Vec<Value>,
    ) -> Result<ScheduledTask> {
        self.add_task(NewTask::daily(job_name, hour, minute).with_args(args)).await
    }

    /// Every week; `day_of_week` uses 0 = Sunday.
    pub async fn schedule_weekly(
        &self,
        job_name: &str,
        day_of_week: u32,
        hour: u32,
        minute: u32,
        args: Vec<Value>,
    ) -> Result<ScheduledTask> {
        self.add_task(NewTask::weekly(job_name, day_of_week, hour, minute).with_args(args))
            .await
    }

    pub async fn schedule_monthly(
        &self,
        job_name: &str,
        day_of_month: u32,
        hour: u32,
        minute: u32,
        args: Vec<Value>,
    ) -> Result<ScheduledTask> {
        self.add_task(NewTask::monthly(job_name, day_of_month, hour, minute).with_args(args))
            .await
    }

    pub async fn schedule_interval(
        &self,
        job_name: &str,
        seconds: u64,
        args: Vec<Value>,
    ) -> Result<ScheduledTask> {
        self.add_task(NewTask::interval(job_name, seconds).with_args(args)).await
    }

    pub async fn schedule_one_time(
        &self,
        job_name: &str,
        run_at: DateTime<Utc>,
        args: Vec<Value>,
    ) -> Result<ScheduledTask> {
        self.add_task(NewTask::once(job_name, run_at).with_args(args)).await
    }

    pub async fn schedule_high_priority(
        &self,
        job_name: &str,
        schedule: ScheduleKind,
        args: Vec<Value>,
    ) -> Result<ScheduledTask> {
        self.add_task(
            NewTask::new(job_name, schedule)
                .with_args(args)
                .with_priority(Priority::High),
        )
        .await
    }

    /// One-shot, low priority, at the start of the next maintenance window.
    /// Runs right away when a window is open now or none are configured.
    pub async fn schedule_during_maintenance_window(
        &self,
        job_name: &str,
        args: Vec<Value>,
    ) -> Result<ScheduledTask> {
        let now = Utc::now();
        let run_at = {
            let calendar = self.calendar();
            if calendar.is_empty() || calendar.in_window(now) {
                now
            } else {
                calendar.next_window_start(now).ok_or_else(|| {
                    MillwrightError::validation("no maintenance window starts within the next week")
                })?
            }
        };
        let new = NewTask::once(job_name, run_at)
            .with_args(args)
            .with_priority(Priority::Low)
            .with_metadata("maintenance_window", Value::Bool(true));
        self.add_task_at(new, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::cron::CronSpec;
    use chrono::{Duration as ChronoDuration, NaiveTime, TimeZone};

    async fn setup() -> (Arc<MemoryBroker>, Scheduler) {
        setup_with(SchedulerSettings::default()).await
    }

    async fn setup_with(settings: SchedulerSettings) -> (Arc<MemoryBroker>, Scheduler) {
        let broker = Arc::new(MemoryBroker::new());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let scheduler = Scheduler::new(store, broker.clone(), settings).await.unwrap();
        (broker, scheduler)
    }

    /// 2026-10-20 is a Tuesday.
    fn day_d(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 20, hour, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn test_cron_next_run_rolls_to_next_day() {
        let (_broker, scheduler) = setup().await;
        let task = scheduler
            .add_task_at(NewTask::daily("reports.generate", 6, 0), day_d(8, 0))
            .await
            .unwrap();
        assert_eq!(
            task.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 10, 21, 6, 0, 0).unwrap())
        );
        assert!(task.task_id.starts_with("scheduled_"));
    }

    #[tokio::test]
    async fn test_add_get_remove_get() {
        let (broker, scheduler) = setup().await;
        let task = scheduler
            .add_task(NewTask::interval("sensors.aggregate", 60))
            .await
            .unwrap();
        assert_eq!(scheduler.get_task(&task.task_id), Some(task.clone()));
        assert!(broker.periodic_entry(&task.task_id).is_some());

        assert!(scheduler.remove_task(&task.task_id).await.unwrap());
        assert!(scheduler.get_task(&task.task_id).is_none());
        assert!(broker.periodic_entry(&task.task_id).is_none());

        // Idempotent.
        assert!(!scheduler.remove_task(&task.task_id).await.unwrap());
        assert!(!scheduler.remove_task("scheduled_0_0").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_config_is_not_persisted() {
        let (broker, scheduler) = setup().await;
        let mut spec = CronSpec::default();
        spec.minute = "61".into();
        let err = scheduler
            .add_task(NewTask::new("x", ScheduleKind::Cron(spec)))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(scheduler.list_tasks(false).is_empty());
        assert_eq!(broker.periodic_len(), 0);

        let err = scheduler.add_task(NewTask::interval("x", 0)).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_schedule_update_reregisters_once() {
        let (broker, scheduler) = setup().await;
        let task = scheduler
            .add_task_at(NewTask::daily("reports.generate", 6, 0), day_d(8, 0))
            .await
            .unwrap();
        assert_eq!(broker.periodic_writes(), 1);

        let patch = TaskPatch::new().schedule(ScheduleKind::Cron(CronSpec::daily(9, 30)));
        let updated = scheduler
            .update_task_at(&task.task_id, patch.clone(), day_d(8, 0))
            .await
            .unwrap();
        assert_eq!(updated.next_run_at, Some(day_d(9, 30)));
        assert_eq!(broker.periodic_writes(), 2);

        for _ in 0..3 {
            scheduler
                .update_task_at(&task.task_id, patch.clone(), day_d(8, 0))
                .await
                .unwrap();
        }
        assert_eq!(broker.periodic_writes(), 2);
        assert_eq!(broker.periodic_len(), 1);
    }

    #[tokio::test]
    async fn test_enable_disable_controls_beat() {
        let (broker, scheduler) = setup().await;
        let task = scheduler
            .add_task(NewTask::interval("sensors.aggregate", 30).disabled())
            .await
            .unwrap();
        assert!(broker.periodic_entry(&task.task_id).is_none());

        scheduler.enable_task(&task.task_id).await.unwrap();
        assert!(broker.periodic_entry(&task.task_id).is_some());

        scheduler.disable_task(&task.task_id).await.unwrap();
        assert!(broker.periodic_entry(&task.task_id).is_none());
        assert!(!scheduler.get_task(&task.task_id).unwrap().enabled);
    }

    #[tokio::test]
    async fn test_priority_change_moves_queue() {
        let (broker, scheduler) = setup().await;
        let task = scheduler
            .add_task(NewTask::interval("sensors.aggregate", 30))
            .await
            .unwrap();
        scheduler
            .update_task(&task.task_id, TaskPatch::new().priority(Priority::Critical))
            .await
            .unwrap();
        assert_eq!(
            broker.periodic_entry(&task.task_id).unwrap().queue,
            crate::router::Queue::High
        );
    }

    #[tokio::test]
    async fn test_update_unknown_is_not_found() {
        let (_broker, scheduler) = setup().await;
        let err = scheduler
            .update_task("ghost", TaskPatch::new().enabled(false))
            .await
            .unwrap_err();
        assert!(matches!(err, MillwrightError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_once_never_in_beat_table() {
        let (broker, scheduler) = setup().await;
        scheduler
            .schedule_one_time("reports.generate", Utc::now() + ChronoDuration::hours(1), vec![])
            .await
            .unwrap();
        assert_eq!(broker.periodic_len(), 0);
    }

    #[tokio::test]
    async fn test_disabled_execute_is_refused() {
        let (broker, scheduler) = setup().await;
        let task = scheduler
            .add_task(NewTask::interval("sensors.aggregate", 30).disabled())
            .await
            .unwrap();
        assert_eq!(
            scheduler.execute_now(&task.task_id, false).await,
            DispatchOutcome::Disabled
        );
        assert!(broker.sent().is_empty());
    }

    #[tokio::test]
    async fn test_run_due_dispatches_one_shots() {
        let (broker, scheduler) = setup().await;
        let now = day_d(12, 0);
        let due = scheduler
            .add_task_at(NewTask::once("reports.generate", now - ChronoDuration::minutes(1)), now)
            .await
            .unwrap();
        scheduler
            .add_task_at(NewTask::once("reports.generate", now + ChronoDuration::hours(1)), now)
            .await
            .unwrap();
        scheduler
            .add_task_at(NewTask::interval("sensors.aggregate", 1), now)
            .await
            .unwrap();

        let results = scheduler.run_due(now).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, due.task_id);
        assert!(results[0].1.is_dispatched());
        assert_eq!(broker.sent().len(), 1);

        // Completed, so not due again.
        assert!(scheduler.run_due(now).await.is_empty());
        assert_eq!(
            scheduler.get_task(&due.task_id).unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_completed_once_task_rearmed_as_interval() {
        let (broker, scheduler) = setup().await;
        let now = day_d(12, 0);
        let task = scheduler
            .add_task_at(NewTask::once("reports.generate", now - ChronoDuration::minutes(1)), now)
            .await
            .unwrap();
        scheduler.run_due(now).await;
        assert_eq!(
            scheduler.get_task(&task.task_id).unwrap().status,
            TaskStatus::Completed
        );

        let later = now + ChronoDuration::minutes(5);
        let updated = scheduler
            .update_task_at(
                &task.task_id,
                TaskPatch::new().schedule(ScheduleKind::Interval { seconds: 60 }),
                later,
            )
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Scheduled);
        assert_eq!(updated.next_run_at, Some(later + ChronoDuration::seconds(60)));
        assert!(broker.periodic_entry(&task.task_id).is_some());
    }

    #[tokio::test]
    async fn test_expired_once_task_rearmed_with_new_run_at() {
        let (_broker, scheduler) = setup().await;
        let now = day_d(12, 0);
        let task = scheduler
            .add_task_at(
                NewTask::once("reports.generate", now + ChronoDuration::hours(1))
                    .expires_at(now + ChronoDuration::minutes(10)),
                now,
            )
            .await
            .unwrap();
        let late = now + ChronoDuration::minutes(20);
        assert_eq!(
            scheduler.execute_at(&task.task_id, false, late).await,
            DispatchOutcome::Expired
        );
        let expired = scheduler.get_task(&task.task_id).unwrap();
        assert_eq!(expired.status, TaskStatus::Expired);
        assert!(expired.next_run_at.is_none());

        let run_at = now + ChronoDuration::hours(2);
        let updated = scheduler
            .update_task_at(
                &task.task_id,
                TaskPatch::new()
                    .schedule(ScheduleKind::Once { run_at })
                    .expires_at(None),
                late,
            )
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Scheduled);
        assert_eq!(updated.next_run_at, Some(run_at));
        assert_eq!(scheduler.due_one_shots(run_at), vec![task.task_id.clone()]);
    }

    #[tokio::test]
    async fn test_clearing_expiry_rearms_expired_task() {
        let (_broker, scheduler) = setup().await;
        let now = day_d(12, 0);
        let run_at = now + ChronoDuration::hours(1);
        let task = scheduler
            .add_task_at(
                NewTask::once("reports.generate", run_at)
                    .expires_at(now + ChronoDuration::minutes(10)),
                now,
            )
            .await
            .unwrap();
        let late = now + ChronoDuration::minutes(20);
        scheduler.execute_at(&task.task_id, false, late).await;

        let updated = scheduler
            .update_task_at(&task.task_id, TaskPatch::new().expires_at(None), late)
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Scheduled);
        assert_eq!(updated.next_run_at, Some(run_at));
    }

    #[tokio::test]
    async fn test_update_then_remove_leaves_no_beat_entry() {
        let (broker, scheduler) = setup().await;
        let task = scheduler
            .add_task(NewTask::interval("sensors.aggregate", 60))
            .await
            .unwrap();
        scheduler.remove_task(&task.task_id).await.unwrap();
        // A sync that arrives after the removal sees the task gone.
        scheduler.sync_beat(&task.task_id).await;
        assert!(broker.periodic_entry(&task.task_id).is_none());
    }

    #[tokio::test]
    async fn test_failed_beat_write_repaired_by_retry() {
        let (broker, scheduler) = setup().await;
        broker.set_fail_periodic(true);
        let task = scheduler
            .add_task(NewTask::interval("sensors.aggregate", 60))
            .await
            .unwrap();
        assert_eq!(scheduler.retry_beat().await, 1);

        broker.set_fail_periodic(false);
        assert_eq!(scheduler.retry_beat().await, 0);
        assert!(broker.periodic_entry(&task.task_id).is_some());
    }

    #[tokio::test]
    async fn test_low_priority_deferred_to_maintenance() {
        let settings = SchedulerSettings {
            defer_low_priority_to_maintenance: true,
            maintenance_windows: vec![MaintenanceWindow::every_day(
                NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            )],
            ..SchedulerSettings::default()
        };
        let (_broker, scheduler) = setup_with(settings).await;
        let noon = day_d(12, 0);
        let low = scheduler
            .add_task_at(
                NewTask::once("cleanup.logs", noon).with_priority(Priority::Low),
                noon,
            )
            .await
            .unwrap();
        let normal = scheduler
            .add_task_at(NewTask::once("reports.generate", noon), noon)
            .await
            .unwrap();

        assert_eq!(scheduler.due_one_shots(noon), vec![normal.task_id]);
        let late = day_d(23, 0);
        assert!(scheduler.due_one_shots(late).contains(&low.task_id));
    }

    #[tokio::test]
    async fn test_statistics_counts() {
        let (_broker, scheduler) = setup().await;
        scheduler
            .add_task(NewTask::interval("a", 60).with_priority(Priority::Critical))
            .await
            .unwrap();
        scheduler.add_task(NewTask::daily("b", 1, 0).disabled()).await.unwrap();
        let stats = scheduler.statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.enabled + stats.disabled, stats.total);
        assert_eq!(stats.by_priority[&Priority::Critical], 1);
        assert_eq!(stats.by_kind["cron"], 1);
        assert!(stats.next_due.is_some());
    }

    #[tokio::test]
    async fn test_maintenance_queries() {
        let (_broker, scheduler) = setup().await;
        assert!(!scheduler.is_maintenance_window(Some(day_d(3, 0))));
        assert!(scheduler.next_maintenance_time(Some(day_d(3, 0))).is_none());

        // Monday 02:00-04:00.
        let window = MaintenanceWindow::new(
            [0],
            NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
        )
        .unwrap();
        scheduler.set_maintenance_windows(vec![window]).unwrap();
        let monday = Utc.with_ymd_and_hms(2026, 10, 19, 3, 0, 0).unwrap();
        assert!(scheduler.is_maintenance_window(Some(monday)));
        assert!(!scheduler.is_maintenance_window(Some(day_d(3, 0))));
        assert_eq!(
            scheduler.next_maintenance_time(Some(day_d(0, 0))),
            Some(Utc.with_ymd_and_hms(2026, 10, 26, 2, 0, 0).unwrap())
        );
        assert_eq!(scheduler.maintenance_windows().len(), 1);
    }

    #[tokio::test]
    async fn test_during_maintenance_window_without_windows_runs_now() {
        let (_broker, scheduler) = setup().await;
        let before = Utc::now();
        let task = scheduler
            .schedule_during_maintenance_window("cleanup.logs", vec![])
            .await
            .unwrap();
        assert_eq!(task.priority, Priority::Low);
        assert!(task.next_run_at.unwrap() >= before);
        assert_eq!(task.metadata["maintenance_window"], Value::Bool(true));
    }

    #[tokio::test]
    async fn test_restart_restores_and_resyncs() {
        let path = std::env::temp_dir().join(format!(
            "millwright_restart_{}.db",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        let task_id = {
            let store = Arc::new(SqliteStore::open(&path).unwrap());
            let broker = Arc::new(MemoryBroker::new());
            let scheduler = Scheduler::new(store, broker, SchedulerSettings::default())
                .await
                .unwrap();
            let task = scheduler
                .schedule_weekly("reports.weekly", 1, 7, 0, vec![])
                .await
                .unwrap();
            task.task_id
        };

        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let broker = Arc::new(MemoryBroker::new());
        let scheduler = Scheduler::new(store, broker.clone(), SchedulerSettings::default())
            .await
            .unwrap();
        assert!(scheduler.get_task(&task_id).is_some());
        assert!(broker.periodic_entry(&task_id).is_some());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_startup_brings_stale_runs_forward() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let now = Utc::now();
        let stale = ScheduledTask {
            task_id: "scheduled_1_1".into(),
            job_name: "sensors.aggregate".into(),
            schedule: ScheduleKind::Interval { seconds: 60 },
            args: vec![],
            kwargs: serde_json::Map::new(),
            priority: Priority::Normal,
            enabled: true,
            status: TaskStatus::Scheduled,
            created_at: now - ChronoDuration::days(2),
            last_run_at: None,
            next_run_at: Some(now - ChronoDuration::days(1)),
            run_count: 0,
            failure_count: 0,
            max_retries: 3,
            timeout_seconds: None,
            expires_at: None,
            metadata: Default::default(),
        };
        let mut expired = stale.clone();
        expired.task_id = "scheduled_1_2".into();
        expired.schedule = ScheduleKind::Once { run_at: now + ChronoDuration::hours(1) };
        expired.expires_at = Some(now - ChronoDuration::minutes(5));
        store.create(&stale).unwrap();
        store.create(&expired).unwrap();

        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(MemoryBroker::new()),
            SchedulerSettings::default(),
        )
        .await
        .unwrap();
        let refreshed = scheduler.get_task("scheduled_1_1").unwrap();
        assert!(refreshed.next_run_at.unwrap() > now);
        assert_eq!(
            store.read("scheduled_1_2").unwrap().unwrap().status,
            TaskStatus::Expired
        );
    }

    #[test]
    fn test_settings_from_config() {
        let config = MillwrightConfig::from_toml(
            r#"
            [scheduler]
            interval_anchor = "now"
            defer_low_priority_to_maintenance = true

            [rate_limits]
            "reports.generate" = "5/m"

            [[maintenance_windows]]
            days_of_week = [5, 6]
            start = "22:00"
            end = "04:00"
            "#,
        )
        .unwrap();
        let settings = SchedulerSettings::from_config(&config).unwrap();
        assert_eq!(settings.interval_anchor, IntervalAnchor::Now);
        assert!(settings.defer_low_priority_to_maintenance);
        assert_eq!(settings.rate_limits["reports.generate"].count, 5);
        assert_eq!(settings.maintenance_windows.len(), 1);
        assert!(settings.maintenance_windows[0].is_overnight());
    }

    #[test]
    fn test_settings_reject_bad_rate_limit() {
        let mut config = MillwrightConfig::default();
        config.rate_limits.insert("reports.generate".into(), "fast".into());
        assert!(SchedulerSettings::from_config(&config).is_err());
    }
}

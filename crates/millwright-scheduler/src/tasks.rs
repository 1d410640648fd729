//! Task definitions: the core data model for scheduled work.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use millwright_core::error::{MillwrightError, Result};

use crate::cron::CronSpec;

/// Ordinal urgency of a task.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Self::Low, Self::Normal, Self::High, Self::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = MillwrightError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(MillwrightError::validation(format!("unknown priority '{other}'"))),
        }
    }
}

/// How/when the task triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Calendar schedule, evaluated to the minute.
    Cron(CronSpec),
    /// Every N seconds.
    Interval { seconds: u64 },
    /// Run once at a specific time.
    Once { run_at: DateTime<Utc> },
}

impl ScheduleKind {
    /// Cron and interval schedules recur; they live in the broker's beat table.
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Once { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Cron(_) => "cron",
            Self::Interval { .. } => "interval",
            Self::Once { .. } => "once",
        }
    }

    /// Reject malformed configs before they reach the store.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        match self {
            Self::Cron(spec) => {
                let schedule = spec.compile()?;
                if schedule.next_after(now).is_none() {
                    return Err(MillwrightError::validation(format!(
                        "cron schedule '{}' never fires",
                        spec.expression()
                    )));
                }
                Ok(())
            }
            Self::Interval { seconds } => {
                if *seconds == 0 {
                    return Err(MillwrightError::validation("interval must be at least 1 second"));
                }
                if i64::try_from(*seconds).is_err() {
                    return Err(MillwrightError::validation("interval is too large"));
                }
                Ok(())
            }
            Self::Once { .. } => Ok(()),
        }
    }
}

/// Lifecycle status. Recurring tasks stay `Scheduled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Scheduled,
    /// A one-shot task that has been dispatched.
    Completed,
    /// A one-shot task whose `expires_at` passed before it could run.
    Expired,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = MillwrightError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            other => Err(MillwrightError::validation(format!("unknown task status '{other}'"))),
        }
    }
}

/// A scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Unique, immutable ID (`scheduled_<millis>_<seq>`).
    pub task_id: String,
    /// Job registered with the broker.
    pub job_name: String,
    pub schedule: ScheduleKind,
    /// Positional payload forwarded to the job.
    pub args: Vec<Value>,
    /// Keyword payload forwarded to the job.
    pub kwargs: Map<String, Value>,
    pub priority: Priority,
    pub enabled: bool,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: u32,
    pub failure_count: u32,
    pub max_retries: u32,
    /// Soft time limit handed to the broker.
    pub timeout_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, Value>,
}

impl ScheduledTask {
    pub fn is_recurring(&self) -> bool {
        self.schedule.is_recurring()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now > expires)
    }

    /// Bring `status` back in line after a patch. A new schedule re-arms a
    /// completed or expired task, a new expiry re-arms an expired one. A
    /// one-shot task whose expiry has already passed ends up `Expired`.
    /// Returns `true` if the status changed.
    pub fn rearm(&mut self, effect: PatchEffect, now: DateTime<Utc>) -> bool {
        let before = self.status;
        let reopen = match self.status {
            TaskStatus::Scheduled => false,
            TaskStatus::Completed => effect.schedule_changed,
            TaskStatus::Expired => effect.schedule_changed || effect.expiry_changed,
        };
        if reopen {
            self.status = TaskStatus::Scheduled;
        }
        if (reopen || effect.expiry_changed)
            && self.status == TaskStatus::Scheduled
            && !self.is_recurring()
            && self.is_expired(now)
        {
            self.status = TaskStatus::Expired;
        }
        self.status != before
    }

    /// A one-shot task the scheduler loop should fire now.
    pub fn is_due_once(&self, now: DateTime<Utc>) -> bool {
        !self.is_recurring()
            && self.enabled
            && self.status == TaskStatus::Scheduled
            && self.next_run_at.is_some_and(|next| next <= now)
    }
}

/// Generates `scheduled_<unix-millis>_<seq>` IDs.
#[derive(Debug, Default)]
pub struct TaskIdGenerator {
    seq: AtomicU64,
}

impl TaskIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self, now: DateTime<Utc>) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("scheduled_{}_{}", now.timestamp_millis(), seq)
    }
}

/// Everything needed to create a task; the scheduler fills in the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub job_name: String,
    pub schedule: ScheduleKind,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub priority: Priority,
    pub enabled: bool,
    /// `None` takes the router's default.
    pub max_retries: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, Value>,
}

impl NewTask {
    pub fn new(job_name: &str, schedule: ScheduleKind) -> Self {
        Self {
            job_name: job_name.to_string(),
            schedule,
            args: Vec::new(),
            kwargs: Map::new(),
            priority: Priority::Normal,
            enabled: true,
            max_retries: None,
            timeout_seconds: None,
            expires_at: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Every day at `hour:minute` UTC.
    pub fn daily(job_name: &str, hour: u32, minute: u32) -> Self {
        Self::new(job_name, ScheduleKind::Cron(CronSpec::daily(hour, minute)))
    }

    /// Every week on `day_of_week` (0 = Sunday) at `hour:minute` UTC.
    pub fn weekly(job_name: &str, day_of_week: u32, hour: u32, minute: u32) -> Self {
        Self::new(
            job_name,
            ScheduleKind::Cron(CronSpec::weekly(day_of_week, hour, minute)),
        )
    }

    /// Every month on `day_of_month` at `hour:minute` UTC.
    pub fn monthly(job_name: &str, day_of_month: u32, hour: u32, minute: u32) -> Self {
        Self::new(
            job_name,
            ScheduleKind::Cron(CronSpec::monthly(day_of_month, hour, minute)),
        )
    }

    pub fn interval(job_name: &str, seconds: u64) -> Self {
        Self::new(job_name, ScheduleKind::Interval { seconds })
    }

    pub fn once(job_name: &str, run_at: DateTime<Utc>) -> Self {
        Self::new(job_name, ScheduleKind::Once { run_at })
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub(crate) fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.job_name.trim().is_empty() {
            return Err(MillwrightError::validation("job_name must not be empty"));
        }
        self.schedule.validate(now)
    }
}

/// Partial update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub job_name: Option<String>,
    pub schedule: Option<ScheduleKind>,
    pub args: Option<Vec<Value>>,
    pub kwargs: Option<Map<String, Value>>,
    pub priority: Option<Priority>,
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub timeout_seconds: Option<Option<u64>>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub metadata: Option<BTreeMap<String, Value>>,
}

/// What a patch actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchEffect {
    pub schedule_changed: bool,
    pub enabled_changed: bool,
    pub expiry_changed: bool,
    pub other_changed: bool,
}

impl PatchEffect {
    pub fn changed(&self) -> bool {
        self.schedule_changed || self.enabled_changed || self.expiry_changed || self.other_changed
    }
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(mut self, schedule: ScheduleKind) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn job_name(mut self, job_name: &str) -> Self {
        self.job_name = Some(job_name.to_string());
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = Some(args);
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = Some(kwargs);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout_seconds(mut self, seconds: Option<u64>) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn expires_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub(crate) fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if let Some(job_name) = &self.job_name {
            if job_name.trim().is_empty() {
                return Err(MillwrightError::validation("job_name must not be empty"));
            }
        }
        if let Some(schedule) = &self.schedule {
            schedule.validate(now)?;
        }
        Ok(())
    }

    /// Apply in place and report which groups of fields changed.
    pub fn apply(&self, task: &mut ScheduledTask) -> PatchEffect {
        let mut effect = PatchEffect::default();

        if let Some(schedule) = &self.schedule {
            if *schedule != task.schedule {
                task.schedule = schedule.clone();
                effect.schedule_changed = true;
            }
        }
        if let Some(enabled) = self.enabled {
            if enabled != task.enabled {
                task.enabled = enabled;
                effect.enabled_changed = true;
            }
        }

        effect.other_changed |= replace(&mut task.job_name, &self.job_name);
        effect.other_changed |= replace(&mut task.args, &self.args);
        effect.other_changed |= replace(&mut task.kwargs, &self.kwargs);
        effect.other_changed |= replace(&mut task.priority, &self.priority);
        effect.other_changed |= replace(&mut task.max_retries, &self.max_retries);
        effect.other_changed |= replace(&mut task.timeout_seconds, &self.timeout_seconds);
        effect.expiry_changed = replace(&mut task.expires_at, &self.expires_at);
        effect.other_changed |= replace(&mut task.metadata, &self.metadata);

        effect
    }
}

fn replace<T: Clone + PartialEq>(field: &mut T, patch: &Option<T>) -> bool {
    match patch {
        Some(value) if value != field => {
            *field = value.clone();
            true
        }
        _ => false,
    }
}

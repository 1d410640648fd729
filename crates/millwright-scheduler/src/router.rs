//! Queue routing: maps task priority onto the broker's execution lanes.
//!
//! Every dispatch also carries a retry/backoff policy, and jobs may carry a
//! rate limit ("10/m") that is enforced here before anything reaches the broker.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use millwright_core::config::RetryConfig;
use millwright_core::error::{MillwrightError, Result};

use crate::tasks::{Priority, ScheduledTask};

/// Broker execution lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Queue {
    Low,
    Default,
    High,
}

impl Queue {
    pub const ALL: [Queue; 3] = [Self::Low, Self::Default, Self::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::Low => "low",
            Queue::Default => "default",
            Queue::High => "high",
        }
    }

    fn index(&self) -> usize {
        match self {
            Queue::Low => 0,
            Queue::Default => 1,
            Queue::High => 2,
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry/backoff policy attached to every dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_secs: u64,
    pub backoff_step_secs: u64,
    pub backoff_cap_secs: u64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `initial + step * attempt`, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let secs = self
            .backoff_step_secs
            .saturating_mul(u64::from(attempt))
            .saturating_add(self.initial_backoff_secs)
            .min(self.backoff_cap_secs);
        Duration::from_secs(secs)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff_secs: config.initial_backoff_secs,
            backoff_step_secs: config.backoff_step_secs,
            backoff_cap_secs: config.backoff_cap_secs,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatePeriod {
    Second,
    Minute,
    Hour,
}

impl RatePeriod {
    fn window(&self) -> chrono::Duration {
        match self {
            RatePeriod::Second => chrono::Duration::seconds(1),
            RatePeriod::Minute => chrono::Duration::minutes(1),
            RatePeriod::Hour => chrono::Duration::hours(1),
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            RatePeriod::Second => "s",
            RatePeriod::Minute => "m",
            RatePeriod::Hour => "h",
        }
    }
}

/// At most `count` dispatches per `per`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub count: u32,
    pub per: RatePeriod,
}

impl FromStr for RateLimit {
    type Err = MillwrightError;

    /// Accepts `"10/m"`, `"2/s"`, `"100/h"` (also `sec`/`min`/`hour` spellings).
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            MillwrightError::validation(format!("invalid rate limit '{s}' (want N/s, N/m or N/h)"))
        };
        let (count, period) = s.trim().split_once('/').ok_or_else(invalid)?;
        let count: u32 = count.trim().parse().map_err(|_| invalid())?;
        if count == 0 {
            return Err(invalid());
        }
        let per = match period.trim() {
            "s" | "sec" | "second" => RatePeriod::Second,
            "m" | "min" | "minute" => RatePeriod::Minute,
            "h" | "hour" => RatePeriod::Hour,
            _ => return Err(invalid()),
        };
        Ok(Self { count, per })
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.count, self.per.suffix())
    }
}

/// Dispatch counters for a single queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: Queue,
    pub dispatched: u64,
}

/// Total priority → queue mapping plus retry and rate-limit lookup.
#[derive(Debug)]
pub struct QueueRouter {
    default_retry: RetryPolicy,
    rate_limits: HashMap<String, RateLimit>,
    /// Recent dispatch instants per rate-limited job.
    recent: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    dispatched: [AtomicU64; 3],
}

impl QueueRouter {
    pub fn new(default_retry: RetryPolicy, rate_limits: HashMap<String, RateLimit>) -> Self {
        Self {
            default_retry,
            rate_limits,
            recent: Mutex::new(HashMap::new()),
            dispatched: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    /// Priority → queue. Total over the enum.
    pub fn route(priority: Priority) -> Queue {
        match priority {
            Priority::Low => Queue::Low,
            Priority::Normal => Queue::Default,
            Priority::High | Priority::Critical => Queue::High,
        }
    }

    pub fn default_retry(&self) -> &RetryPolicy {
        &self.default_retry
    }

    /// The router's backoff settings with the task's own retry budget.
    pub fn retry_policy_for(&self, task: &ScheduledTask) -> RetryPolicy {
        RetryPolicy {
            max_retries: task.max_retries,
            ..self.default_retry.clone()
        }
    }

    pub fn rate_limit(&self, job_name: &str) -> Option<RateLimit> {
        self.rate_limits.get(job_name).copied()
    }

    /// Take a slot in the job's rate window. Always succeeds for unlimited jobs.
    pub fn try_acquire(&self, job_name: &str, now: DateTime<Utc>) -> bool {
        let Some(limit) = self.rate_limit(job_name) else {
            return true;
        };
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        let window = recent.entry(job_name.to_string()).or_default();
        let horizon = now - limit.per.window();
        while window.front().is_some_and(|t| *t <= horizon) {
            window.pop_front();
        }
        if window.len() >= limit.count as usize {
            tracing::debug!(
                "Rate limit {} reached for job '{}' ({} in window)",
                limit,
                job_name,
                window.len()
            );
            return false;
        }
        window.push_back(now);
        true
    }

    /// Give back a slot taken at `at` whose dispatch never reached the broker.
    pub fn release(&self, job_name: &str, at: DateTime<Utc>) {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(window) = recent.get_mut(job_name) {
            if let Some(pos) = window.iter().rposition(|t| *t == at) {
                window.remove(pos);
            }
        }
    }

    pub fn record_dispatch(&self, queue: Queue) {
        self.dispatched[queue.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> Vec<QueueStats> {
        Queue::ALL
            .iter()
            .map(|queue| QueueStats {
                queue: *queue,
                dispatched: self.dispatched[queue.index()].load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Priority → queue table, for diagnostics.
    pub fn routing_table() -> BTreeMap<Priority, Queue> {
        Priority::ALL.iter().map(|p| (*p, Self::route(*p))).collect()
    }
}

impl Default for QueueRouter {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), HashMap::new())
    }
}

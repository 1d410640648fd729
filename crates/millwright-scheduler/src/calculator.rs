//! Next-run computation for every schedule kind.

use chrono::{DateTime, Duration, Utc};

use millwright_core::config::IntervalAnchor;

use crate::tasks::{ScheduleKind, ScheduledTask, TaskStatus};

/// Pure `(schedule, now) -> next_run_at`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NextRunCalculator {
    anchor: IntervalAnchor,
}

impl NextRunCalculator {
    pub fn new(anchor: IntervalAnchor) -> Self {
        Self { anchor }
    }

    /// Next run for a schedule with no prior slot (creation, config change, enable).
    pub fn next_run(&self, schedule: &ScheduleKind, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_run_from(schedule, None, now)
    }

    /// Next run given the slot that was just consumed.
    ///
    /// `previous` only matters for interval schedules in [`IntervalAnchor::Previous`]
    /// mode, where the result is `previous + k * seconds` for the smallest `k >= 1`
    /// landing strictly after `now`. Missed slots are skipped, not replayed.
    pub fn next_run_from(
        &self,
        schedule: &ScheduleKind,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match schedule {
            ScheduleKind::Once { run_at } => Some(*run_at),
            ScheduleKind::Interval { seconds } => {
                let step = Duration::seconds(i64::try_from(*seconds).ok()?);
                match (self.anchor, previous) {
                    (IntervalAnchor::Previous, Some(prev)) => Some(anchored(prev, step, now)),
                    _ => now.checked_add_signed(step),
                }
            }
            ScheduleKind::Cron(spec) => spec.compile().ok()?.next_after(now),
        }
    }

    /// Next run for a task as it currently stands. One-shot tasks that completed
    /// or expired have none.
    pub fn for_task(&self, task: &ScheduledTask, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !task.is_recurring() && task.status != TaskStatus::Scheduled {
            return None;
        }
        self.next_run(&task.schedule, now)
    }

    /// Next run after the task's current slot was dispatched at `now`.
    pub fn after_dispatch(
        &self,
        task: &ScheduledTask,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if !task.is_recurring() {
            return None;
        }
        self.next_run_from(&task.schedule, task.next_run_at, now)
    }
}

fn anchored(prev: DateTime<Utc>, step: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    let first = prev + step;
    if first > now {
        return first;
    }
    let step_ms = step.num_milliseconds().max(1);
    let behind = (now - first).num_milliseconds();
    let skipped = behind / step_ms + 1;
    first + Duration::milliseconds(skipped * step_ms)
}

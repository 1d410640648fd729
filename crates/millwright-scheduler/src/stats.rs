//! Read-only statistics over a snapshot of the cache.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::maintenance::{MaintenanceCalendar, MaintenanceStatus};
use crate::router::QueueStats;
use crate::tasks::{Priority, ScheduledTask, TaskStatus};

/// The enabled task that fires first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NextDue {
    pub task_id: String,
    pub job_name: String,
    pub next_run_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatistics {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    /// Every priority is present, zero or not.
    pub by_priority: BTreeMap<Priority, usize>,
    pub by_kind: BTreeMap<&'static str, usize>,
    pub by_status: BTreeMap<&'static str, usize>,
    pub next_due: Option<NextDue>,
    pub maintenance: MaintenanceStatus,
    pub queues: Vec<QueueStats>,
    pub total_runs: u64,
    pub total_failures: u64,
    pub generated_at: DateTime<Utc>,
}

impl TaskStatistics {
    /// Single pass over `tasks`.
    pub fn collect(
        tasks: &[ScheduledTask],
        calendar: &MaintenanceCalendar,
        queues: Vec<QueueStats>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut by_priority: BTreeMap<Priority, usize> =
            Priority::ALL.iter().map(|p| (*p, 0)).collect();
        let mut by_kind = BTreeMap::new();
        let mut by_status = BTreeMap::new();
        let mut enabled = 0;
        let mut total_runs = 0u64;
        let mut total_failures = 0u64;
        let mut next_due: Option<&ScheduledTask> = None;

        for task in tasks {
            *by_priority.entry(task.priority).or_insert(0) += 1;
            *by_kind.entry(task.schedule.label()).or_insert(0) += 1;
            *by_status.entry(task.status.as_str()).or_insert(0) += 1;
            total_runs += u64::from(task.run_count);
            total_failures += u64::from(task.failure_count);

            if !task.enabled {
                continue;
            }
            enabled += 1;
            if task.status != TaskStatus::Scheduled {
                continue;
            }
            if let Some(next) = task.next_run_at {
                let earlier = match next_due.and_then(|t| t.next_run_at) {
                    Some(current) => next < current,
                    None => true,
                };
                if earlier {
                    next_due = Some(task);
                }
            }
        }

        Self {
            total: tasks.len(),
            enabled,
            disabled: tasks.len() - enabled,
            by_priority,
            by_kind,
            by_status,
            next_due: next_due.and_then(|t| {
                t.next_run_at.map(|next_run_at| NextDue {
                    task_id: t.task_id.clone(),
                    job_name: t.job_name.clone(),
                    next_run_at,
                })
            }),
            maintenance: calendar.status(now),
            queues,
            total_runs,
            total_failures,
            generated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maintenance::MaintenanceWindow;
    use crate::tasks::ScheduleKind;
    use chrono::{Duration, NaiveTime, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 20, 23, 30, 0).unwrap()
    }

    fn task(id: &str, priority: Priority, enabled: bool, next: Option<i64>) -> ScheduledTask {
        ScheduledTask {
            task_id: id.to_string(),
            job_name: format!("job.{id}"),
            schedule: ScheduleKind::Interval { seconds: 60 },
            args: vec![],
            kwargs: serde_json::Map::new(),
            priority,
            enabled,
            status: TaskStatus::Scheduled,
            created_at: now(),
            last_run_at: None,
            next_run_at: next.map(|m| now() + Duration::minutes(m)),
            run_count: 2,
            failure_count: 1,
            max_retries: 3,
            timeout_seconds: None,
            expires_at: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_counts_add_up() {
        let mut once = task("d", Priority::Low, true, Some(1));
        once.schedule = ScheduleKind::Once { run_at: now() };
        once.status = TaskStatus::Completed;
        let tasks = vec![
            task("a", Priority::High, true, Some(30)),
            task("b", Priority::High, false, Some(5)),
            task("c", Priority::Critical, true, Some(10)),
            once,
        ];
        let stats = TaskStatistics::collect(&tasks, &MaintenanceCalendar::default(), vec![], now());

        assert_eq!(stats.total, 4);
        assert_eq!(stats.enabled + stats.disabled, stats.total);
        assert_eq!(stats.disabled, 1);
        assert_eq!(stats.by_priority[&Priority::High], 2);
        assert_eq!(stats.by_priority[&Priority::Normal], 0);
        assert_eq!(stats.by_kind["interval"], 3);
        assert_eq!(stats.by_kind["once"], 1);
        assert_eq!(stats.by_status["completed"], 1);
        assert_eq!(stats.total_runs, 8);
        assert_eq!(stats.total_failures, 4);

        // "b" is sooner but disabled; "d" is sooner but completed.
        assert_eq!(stats.next_due.unwrap().task_id, "c");
    }

    #[test]
    fn test_empty_snapshot() {
        let stats = TaskStatistics::collect(&[], &MaintenanceCalendar::default(), vec![], now());
        assert_eq!(stats.total, 0);
        assert!(stats.next_due.is_none());
        assert!(!stats.maintenance.in_window);
        assert_eq!(stats.by_priority.len(), Priority::ALL.len());
    }

    #[test]
    fn test_maintenance_status_included() {
        let calendar = MaintenanceCalendar::new(vec![MaintenanceWindow::every_day(
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
        )]);
        let stats = TaskStatistics::collect(&[], &calendar, vec![], now());
        assert!(stats.maintenance.in_window);
        assert_eq!(
            stats.maintenance.next_start,
            Some(Utc.with_ymd_and_hms(2026, 10, 21, 22, 0, 0).unwrap())
        );
    }
}

//! # Millwright Scheduler
//!
//! Dynamic task scheduling and priority-queue routing for background work.
//! Decides *when* a job runs and *which* broker queue it goes to; the jobs
//! themselves run on an external broker.
//!
//! ## Design Principles
//! - One explicit `Scheduler` object, shared by `Arc`; no global state
//! - SQLite persistence, write-through from an in-memory cache
//! - Recurring tasks live in the broker's beat table iff enabled
//! - Every dispatch failure is a value; the loop never dies on one task
//!
//! ## Architecture
//! ```text
//! Scheduler
//!   ├── ScheduleCache ──write-through──▶ SqliteStore
//!   ├── NextRunCalculator: cron "0 6 * * *" / every 300s / once at T
//!   ├── MaintenanceCalendar: Mon 02:00-04:00, daily 22:00-02:00
//!   ├── QueueRouter: Low→low, Normal→default, High|Critical→high
//!   ├── BeatSynchronizer ──set/remove periodic──▶ Broker
//!   └── Dispatcher ──send──▶ Broker
//!
//! Engine loop (tokio interval + mpsc)
//!   ├── tick → dispatch due one-shot tasks
//!   └── SchedulerCommand::Execute from broker callbacks
//! ```

pub mod beat;
pub mod broker;
pub mod cache;
pub mod calculator;
pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod maintenance;
pub mod router;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod tasks;

pub use beat::{BeatSynchronizer, PeriodicEntry, ScheduleExpression};
pub use broker::{Broker, DispatchRequest, HttpBroker, MemoryBroker, TaskHandle};
pub use cache::ScheduleCache;
pub use calculator::NextRunCalculator;
pub use cron::{CronSchedule, CronSpec};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use engine::{SchedulerCommand, SchedulerHandle, spawn_scheduler};
pub use maintenance::{MaintenanceCalendar, MaintenanceStatus, MaintenanceWindow};
pub use router::{Queue, QueueRouter, QueueStats, RateLimit, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerSettings};
pub use stats::{NextDue, TaskStatistics};
pub use store::{ScheduleStore, SqliteStore};
pub use tasks::{NewTask, Priority, ScheduleKind, ScheduledTask, TaskPatch, TaskStatus};

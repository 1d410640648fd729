//! Scheduler loop. Ticks on `check_interval` and consumes commands.
//! Uses tokio::interval, so it sleeps between checks. Each tick first retries
//! beat writes the broker rejected, then fires due one-shot tasks.
//!
//! Broker-side callbacks never call into the scheduler directly. They hold a
//! [`SchedulerHandle`] and enqueue a [`SchedulerCommand`]; the loop executes
//! commands one at a time.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use millwright_core::error::{MillwrightError, Result};

use crate::dispatch::DispatchOutcome;
use crate::scheduler::Scheduler;

const COMMAND_BUFFER: usize = 256;

#[derive(Debug)]
pub enum SchedulerCommand {
    /// Dispatch a task now. `reply` receives the outcome if present.
    Execute {
        task_id: String,
        force: bool,
        reply: Option<oneshot::Sender<DispatchOutcome>>,
    },
    /// Run a due-task check immediately.
    Tick,
    Shutdown,
}

/// Cloneable sender side of the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    async fn send(&self, command: SchedulerCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| MillwrightError::Stopped)
    }

    /// Dispatch through the loop and wait for the outcome.
    pub async fn execute(&self, task_id: &str, force: bool) -> Result<DispatchOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::Execute {
            task_id: task_id.to_string(),
            force,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| MillwrightError::Stopped)
    }

    /// Queue a dispatch without waiting for it.
    pub async fn enqueue_execute(&self, task_id: &str, force: bool) -> Result<()> {
        self.send(SchedulerCommand::Execute {
            task_id: task_id.to_string(),
            force,
            reply: None,
        })
        .await
    }

    pub async fn tick(&self) -> Result<()> {
        self.send(SchedulerCommand::Tick).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(SchedulerCommand::Shutdown).await
    }
}

/// Start the scheduler loop on the current tokio runtime.
pub fn spawn_scheduler(scheduler: Arc<Scheduler>) -> (SchedulerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let join = tokio::spawn(run_loop(scheduler, rx));
    (SchedulerHandle { tx }, join)
}

async fn run_loop(scheduler: Arc<Scheduler>, mut rx: mpsc::Receiver<SchedulerCommand>) {
    let period = scheduler.check_interval();
    tracing::info!("⏰ Scheduler loop started (check every {}s)", period.as_secs());

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => run_tick(&scheduler).await,
            command = rx.recv() => match command {
                Some(SchedulerCommand::Execute { task_id, force, reply }) => {
                    let outcome = scheduler.execute_now(&task_id, force).await;
                    tracing::debug!("Command execute {} → {}", task_id, outcome);
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    }
                }
                Some(SchedulerCommand::Tick) => run_tick(&scheduler).await,
                Some(SchedulerCommand::Shutdown) | None => break,
            },
        }
    }

    tracing::info!("⏰ Scheduler loop stopped");
}

async fn run_tick(scheduler: &Scheduler) {
    scheduler.retry_beat().await;
    let results = scheduler.run_due(Utc::now()).await;
    for (task_id, outcome) in &results {
        match outcome {
            DispatchOutcome::Dispatched(_) => {}
            other => tracing::warn!("⚠️ Due task {} not dispatched: {}", task_id, other),
        }
    }
    if !results.is_empty() {
        tracing::debug!("Tick handled {} due tasks", results.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::scheduler::SchedulerSettings;
    use crate::store::SqliteStore;
    use crate::tasks::NewTask;
    use std::time::Duration;

    async fn start() -> (Arc<MemoryBroker>, Arc<Scheduler>) {
        let broker = Arc::new(MemoryBroker::new());
        let settings = SchedulerSettings {
            check_interval: Duration::from_secs(3600),
            ..SchedulerSettings::default()
        };
        let scheduler = Scheduler::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            broker.clone(),
            settings,
        )
        .await
        .unwrap();
        (broker, Arc::new(scheduler))
    }

    #[tokio::test]
    async fn test_execute_through_handle() {
        let (broker, scheduler) = start().await;
        let task = scheduler
            .add_task(NewTask::interval("sensors.aggregate", 60))
            .await
            .unwrap();
        let (handle, join) = spawn_scheduler(scheduler.clone());

        let outcome = handle.execute(&task.task_id, false).await.unwrap();
        assert!(outcome.is_dispatched());
        assert_eq!(
            handle.execute("ghost", true).await.unwrap(),
            DispatchOutcome::NotFound
        );

        handle.shutdown().await.unwrap();
        join.await.unwrap();
        assert_eq!(broker.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueued_commands_run_before_shutdown() {
        let (broker, scheduler) = start().await;
        let task = scheduler
            .add_task(NewTask::interval("sensors.aggregate", 60))
            .await
            .unwrap();
        let (handle, join) = spawn_scheduler(scheduler.clone());

        handle.enqueue_execute(&task.task_id, false).await.unwrap();
        handle.enqueue_execute(&task.task_id, false).await.unwrap();
        handle.shutdown().await.unwrap();
        join.await.unwrap();

        assert_eq!(broker.sent().len(), 2);
        assert_eq!(scheduler.get_task(&task.task_id).unwrap().run_count, 2);
    }

    #[tokio::test]
    async fn test_tick_fires_due_one_shot() {
        let (broker, scheduler) = start().await;
        let task = scheduler
            .add_task(NewTask::once("reports.generate", Utc::now()))
            .await
            .unwrap();
        let (handle, join) = spawn_scheduler(scheduler.clone());

        handle.tick().await.unwrap();
        handle.shutdown().await.unwrap();
        join.await.unwrap();

        assert_eq!(broker.sent().len(), 1);
        assert_eq!(broker.sent()[0].task_id, task.task_id);
    }

    #[tokio::test]
    async fn test_tick_repairs_beat_table() {
        let (broker, scheduler) = start().await;
        broker.set_fail_periodic(true);
        let task = scheduler
            .add_task(NewTask::interval("sensors.aggregate", 60))
            .await
            .unwrap();
        assert!(broker.periodic_entry(&task.task_id).is_none());

        broker.set_fail_periodic(false);
        let (handle, join) = spawn_scheduler(scheduler.clone());
        handle.tick().await.unwrap();
        handle.shutdown().await.unwrap();
        join.await.unwrap();

        assert!(broker.periodic_entry(&task.task_id).is_some());
    }

    #[tokio::test]
    async fn test_handle_after_stop() {
        let (_broker, scheduler) = start().await;
        let (handle, join) = spawn_scheduler(scheduler);
        handle.shutdown().await.unwrap();
        join.await.unwrap();
        assert!(matches!(
            handle.execute("any", false).await,
            Err(MillwrightError::Stopped)
        ));
    }
}

//! # Millwright Task Scheduler CLI
//!
//! Manages scheduled background jobs and runs the scheduler loop.
//!
//! Usage:
//!   millwright run                                   # Start the scheduler loop
//!   millwright add-cron reports.daily "0 6 * * *"    # Recurring calendar job
//!   millwright add-interval sensors.aggregate 300    # Every 5 minutes
//!   millwright list --enabled-only
//!   millwright exec scheduled_1760000000000_1 --force
//!   millwright --dry-run stats                       # In-memory broker

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use millwright_core::MillwrightConfig;
use millwright_scheduler::{
    Broker, CronSpec, HttpBroker, MemoryBroker, NewTask, Priority, ScheduleKind, ScheduledTask,
    Scheduler, spawn_scheduler,
};

#[derive(Parser)]
#[command(
    name = "millwright",
    version,
    about = "⚙️ Millwright: dynamic task scheduling and priority-queue routing"
)]
struct Cli {
    /// Config file (default: ~/.millwright/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Use an in-memory broker instead of the configured one
    #[arg(long)]
    dry_run: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop until Ctrl-C
    Run,
    /// Add a cron task ("MIN HOUR DOM MON DOW", UTC)
    AddCron {
        job_name: String,
        expression: String,
        #[command(flatten)]
        opts: TaskOpts,
    },
    /// Add an interval task
    AddInterval {
        job_name: String,
        seconds: u64,
        #[command(flatten)]
        opts: TaskOpts,
    },
    /// Add a one-shot task (RFC 3339 timestamp)
    AddOnce {
        job_name: String,
        run_at: DateTime<Utc>,
        #[command(flatten)]
        opts: TaskOpts,
    },
    /// List tasks
    List {
        #[arg(long)]
        enabled_only: bool,
    },
    /// Remove a task (unknown IDs are ignored)
    Remove { task_id: String },
    Enable { task_id: String },
    Disable { task_id: String },
    /// Dispatch a task now
    Exec {
        task_id: String,
        /// Dispatch even if the task is disabled
        #[arg(long)]
        force: bool,
    },
    /// Print task statistics as JSON
    Stats,
    /// Show maintenance window status
    Maintenance {
        /// Evaluate at this instant instead of now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
}

#[derive(clap::Args)]
struct TaskOpts {
    /// low | normal | high | critical
    #[arg(short, long, default_value = "normal")]
    priority: Priority,

    /// Positional job arguments as a JSON array
    #[arg(long)]
    args: Option<String>,

    /// Soft time limit in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Stop dispatching after this instant (RFC 3339)
    #[arg(long)]
    expires_at: Option<DateTime<Utc>>,

    /// Create the task disabled
    #[arg(long)]
    disabled: bool,
}

impl TaskOpts {
    fn apply(self, mut new: NewTask) -> Result<NewTask> {
        if let Some(args) = &self.args {
            let args: Vec<Value> =
                serde_json::from_str(args).context("--args must be a JSON array")?;
            new = new.with_args(args);
        }
        new = new.with_priority(self.priority);
        if let Some(timeout) = self.timeout {
            new = new.with_timeout(timeout);
        }
        if let Some(at) = self.expires_at {
            new = new.expires_at(at);
        }
        if self.disabled {
            new = new.disabled();
        }
        Ok(new)
    }
}

fn load_config(path: Option<&str>) -> Result<MillwrightConfig> {
    let config = match path {
        Some(p) => {
            let expanded = PathBuf::from(shellexpand::tilde(p).to_string());
            MillwrightConfig::load_from(&expanded)
                .with_context(|| format!("loading {}", expanded.display()))?
        }
        None => MillwrightConfig::load()?,
    };
    Ok(config)
}

fn build_broker(config: &MillwrightConfig, dry_run: bool) -> Result<Arc<dyn Broker>> {
    if dry_run {
        tracing::info!("🧪 Dry run: using in-memory broker");
        return Ok(Arc::new(MemoryBroker::new()));
    }
    match &config.broker.url {
        Some(url) => {
            let broker = HttpBroker::new(url, Duration::from_secs(config.broker.timeout_secs))?;
            tracing::info!("📡 Broker: {}", url);
            Ok(Arc::new(broker))
        }
        None => {
            tracing::warn!("⚠️ No broker.url configured, using in-memory broker");
            Ok(Arc::new(MemoryBroker::new()))
        }
    }
}

fn print_task(task: &ScheduledTask) {
    let next = task
        .next_run_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".into());
    println!(
        "{} {:<28} {:<8} {:<8} {:<9} next: {}  runs: {}  failures: {}",
        if task.enabled { "✅" } else { "⏸️" },
        task.task_id,
        task.schedule.label(),
        task.priority,
        task.status.as_str(),
        next,
        task.run_count,
        task.failure_count
    );
    println!("   job: {}", task.job_name);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "millwright=debug,millwright_scheduler=debug,millwright_core=debug"
    } else {
        "millwright=info,millwright_scheduler=info,millwright_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let broker = build_broker(&config, cli.dry_run)?;
    let scheduler = Arc::new(Scheduler::open(&config, broker).await?);

    match cli.command {
        Command::Run => {
            let (handle, join) = spawn_scheduler(scheduler.clone());
            println!("⚙️ Millwright scheduler running, Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            tracing::info!("🛑 Shutting down");
            handle.shutdown().await?;
            join.await?;
        }
        Command::AddCron {
            job_name,
            expression,
            opts,
        } => {
            let spec = CronSpec::parse(&expression)?;
            let new = opts.apply(NewTask::new(&job_name, ScheduleKind::Cron(spec)))?;
            let task = scheduler.add_task(new).await?;
            println!("📅 Added {}", task.task_id);
            print_task(&task);
        }
        Command::AddInterval {
            job_name,
            seconds,
            opts,
        } => {
            let new = opts.apply(NewTask::interval(&job_name, seconds))?;
            let task = scheduler.add_task(new).await?;
            println!("📅 Added {}", task.task_id);
            print_task(&task);
        }
        Command::AddOnce {
            job_name,
            run_at,
            opts,
        } => {
            let new = opts.apply(NewTask::once(&job_name, run_at))?;
            let task = scheduler.add_task(new).await?;
            println!("📅 Added {}", task.task_id);
            print_task(&task);
        }
        Command::List { enabled_only } => {
            let tasks = scheduler.list_tasks(enabled_only);
            if tasks.is_empty() {
                println!("No scheduled tasks.");
            }
            for task in &tasks {
                print_task(task);
            }
        }
        Command::Remove { task_id } => {
            if scheduler.remove_task(&task_id).await? {
                println!("🗑️ Removed {task_id}");
            } else {
                println!("Nothing to remove: {task_id} not found");
            }
        }
        Command::Enable { task_id } => {
            let task = scheduler.enable_task(&task_id).await?;
            print_task(&task);
        }
        Command::Disable { task_id } => {
            let task = scheduler.disable_task(&task_id).await?;
            print_task(&task);
        }
        Command::Exec { task_id, force } => {
            let outcome = scheduler.execute_now(&task_id, force).await;
            println!("🚀 {task_id}: {outcome}");
        }
        Command::Stats => {
            let stats = scheduler.statistics();
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Maintenance { at } => {
            let at = at.unwrap_or_else(Utc::now);
            let windows = scheduler.maintenance_windows();
            if windows.is_empty() {
                println!("No maintenance windows configured.");
                return Ok(());
            }
            for w in &windows {
                let days = if w.days_of_week.is_empty() {
                    "every day".to_string()
                } else {
                    w.days_of_week
                        .iter()
                        .map(|d| d.to_string())
                        .collect::<Vec<_>>()
                        .join(",")
                };
                println!("🛠️ {} {}-{}", days, w.start.format("%H:%M"), w.end.format("%H:%M"));
            }
            println!(
                "In window at {}: {}",
                at.format("%Y-%m-%d %H:%M UTC"),
                scheduler.is_maintenance_window(Some(at))
            );
            match scheduler.next_maintenance_time(Some(at)) {
                Some(next) => println!("Next window starts: {}", next.format("%Y-%m-%d %H:%M UTC")),
                None => println!("No window starts within the next week."),
            }
        }
    }

    Ok(())
}

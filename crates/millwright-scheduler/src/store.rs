//! Durable schedule storage.
//!
//! `ScheduleStore` is the seam; `SqliteStore` is the production backend.
//! Every write runs inside a transaction so a crash never leaves a half row.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use millwright_core::error::{MillwrightError, Result};

use crate::maintenance::MaintenanceWindow;
use crate::tasks::{ScheduledTask, TaskStatus};

/// Durable CRUD for scheduled tasks and maintenance windows.
pub trait ScheduleStore: Send + Sync {
    /// Insert a new task; fails if the ID already exists.
    fn create(&self, task: &ScheduledTask) -> Result<()>;
    fn read(&self, task_id: &str) -> Result<Option<ScheduledTask>>;
    /// Overwrite an existing task; `NotFound` if it is gone.
    fn update(&self, task: &ScheduledTask) -> Result<()>;
    /// Returns whether a row was removed. Unknown IDs are not an error.
    fn delete(&self, task_id: &str) -> Result<bool>;
    fn load_all(&self) -> Result<Vec<ScheduledTask>>;
    /// Replace the stored window set.
    fn save_windows(&self, windows: &[MaintenanceWindow]) -> Result<()>;
    fn load_windows(&self) -> Result<Vec<MaintenanceWindow>>;
}

/// SQLite-backed schedule store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const TASK_COLUMNS: &str = "task_id, job_name, schedule, args, kwargs, priority, enabled, status,
     created_at, last_run_at, next_run_at, run_count, failure_count, max_retries,
     timeout_seconds, expires_at, metadata";

impl SqliteStore {
    /// Open or create the schedule database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn =
            Connection::open(path).map_err(|e| MillwrightError::store(format!("DB open: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        tracing::debug!("💾 Schedule store opened at {}", path.display());
        Ok(store)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| MillwrightError::store(format!("DB open: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) -> Result<()> {
        self.lock()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                task_id TEXT PRIMARY KEY,
                job_name TEXT NOT NULL,
                schedule TEXT NOT NULL,          -- JSON: {kind: cron|interval|once, ...}
                args TEXT NOT NULL DEFAULT '[]',
                kwargs TEXT NOT NULL DEFAULT '{}',
                priority TEXT NOT NULL DEFAULT 'normal',
                enabled INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'scheduled',
                created_at TEXT NOT NULL,
                last_run_at TEXT,
                next_run_at TEXT,
                run_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                timeout_seconds INTEGER,
                expires_at TEXT,
                metadata TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS maintenance_windows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                days_of_week TEXT NOT NULL DEFAULT '[]',   -- JSON array, 0 = Monday
                start_time TEXT NOT NULL,                  -- HH:MM:SS
                end_time TEXT NOT NULL
            );
         ",
            )
            .map_err(|e| MillwrightError::store(format!("Migration: {e}")))
    }

    fn write_task(conn: &mut Connection, task: &ScheduledTask, insert: bool) -> Result<()> {
        let row = TaskRow::from_task(task)?;
        let tx = conn
            .transaction()
            .map_err(|e| MillwrightError::store(format!("Begin: {e}")))?;
        let sql = if insert {
            format!(
                "INSERT INTO scheduled_tasks ({TASK_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17)"
            )
        } else {
            "UPDATE scheduled_tasks SET
                job_name = ?2, schedule = ?3, args = ?4, kwargs = ?5, priority = ?6, enabled = ?7,
                status = ?8, created_at = ?9, last_run_at = ?10, next_run_at = ?11, run_count = ?12,
                failure_count = ?13, max_retries = ?14, timeout_seconds = ?15, expires_at = ?16,
                metadata = ?17
             WHERE task_id = ?1"
                .to_string()
        };
        let changed = tx
            .execute(
                &sql,
                params![
                    row.task_id,
                    row.job_name,
                    row.schedule,
                    row.args,
                    row.kwargs,
                    row.priority,
                    row.enabled,
                    row.status,
                    row.created_at,
                    row.last_run_at,
                    row.next_run_at,
                    row.run_count,
                    row.failure_count,
                    row.max_retries,
                    row.timeout_seconds,
                    row.expires_at,
                    row.metadata,
                ],
            )
            .map_err(|e| MillwrightError::store(format!("Save task {}: {e}", task.task_id)))?;
        if changed == 0 {
            return Err(MillwrightError::NotFound(task.task_id.clone()));
        }
        tx.commit()
            .map_err(|e| MillwrightError::store(format!("Commit: {e}")))
    }
}

impl ScheduleStore for SqliteStore {
    fn create(&self, task: &ScheduledTask) -> Result<()> {
        Self::write_task(&mut self.lock(), task, true)
    }

    fn read(&self, task_id: &str) -> Result<Option<ScheduledTask>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE task_id = ?1"),
                [task_id],
                TaskRow::from_row,
            )
            .optional()
            .map_err(|e| MillwrightError::store(format!("Read task {task_id}: {e}")))?;
        row.map(TaskRow::into_task).transpose()
    }

    fn update(&self, task: &ScheduledTask) -> Result<()> {
        Self::write_task(&mut self.lock(), task, false)
    }

    fn delete(&self, task_id: &str) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| MillwrightError::store(format!("Begin: {e}")))?;
        let removed = tx
            .execute("DELETE FROM scheduled_tasks WHERE task_id = ?1", [task_id])
            .map_err(|e| MillwrightError::store(format!("Delete task {task_id}: {e}")))?;
        tx.commit()
            .map_err(|e| MillwrightError::store(format!("Commit: {e}")))?;
        Ok(removed > 0)
    }

    fn load_all(&self) -> Result<Vec<ScheduledTask>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY created_at, task_id"
            ))
            .map_err(|e| MillwrightError::store(format!("Load tasks: {e}")))?;
        let rows = stmt
            .query_map([], TaskRow::from_row)
            .map_err(|e| MillwrightError::store(format!("Load tasks: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| MillwrightError::store(format!("Load tasks: {e}")))?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    fn save_windows(&self, windows: &[MaintenanceWindow]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| MillwrightError::store(format!("Begin: {e}")))?;
        tx.execute("DELETE FROM maintenance_windows", [])
            .map_err(|e| MillwrightError::store(format!("Clear windows: {e}")))?;
        for window in windows {
            tx.execute(
                "INSERT INTO maintenance_windows (days_of_week, start_time, end_time)
                 VALUES (?1, ?2, ?3)",
                params![
                    serde_json::to_string(&window.days_of_week)?,
                    window.start.format("%H:%M:%S").to_string(),
                    window.end.format("%H:%M:%S").to_string(),
                ],
            )
            .map_err(|e| MillwrightError::store(format!("Save window: {e}")))?;
        }
        tx.commit()
            .map_err(|e| MillwrightError::store(format!("Commit: {e}")))
    }

    fn load_windows(&self) -> Result<Vec<MaintenanceWindow>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT days_of_week, start_time, end_time FROM maintenance_windows ORDER BY id",
            )
            .map_err(|e| MillwrightError::store(format!("Load windows: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| MillwrightError::store(format!("Load windows: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| MillwrightError::store(format!("Load windows: {e}")))?;

        rows.into_iter()
            .map(|(days, start, end)| {
                let days: Vec<u8> = serde_json::from_str(&days)?;
                MaintenanceWindow::new(
                    days,
                    crate::maintenance::parse_time_of_day(&start)?,
                    crate::maintenance::parse_time_of_day(&end)?,
                )
            })
            .collect()
    }
}

/// Raw column values, converted to and from `ScheduledTask` outside rusqlite closures.
struct TaskRow {
    task_id: String,
    job_name: String,
    schedule: String,
    args: String,
    kwargs: String,
    priority: String,
    enabled: bool,
    status: String,
    created_at: String,
    last_run_at: Option<String>,
    next_run_at: Option<String>,
    run_count: u32,
    failure_count: u32,
    max_retries: u32,
    timeout_seconds: Option<i64>,
    expires_at: Option<String>,
    metadata: String,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            task_id: row.get(0)?,
            job_name: row.get(1)?,
            schedule: row.get(2)?,
            args: row.get(3)?,
            kwargs: row.get(4)?,
            priority: row.get(5)?,
            enabled: row.get(6)?,
            status: row.get(7)?,
            created_at: row.get(8)?,
            last_run_at: row.get(9)?,
            next_run_at: row.get(10)?,
            run_count: row.get(11)?,
            failure_count: row.get(12)?,
            max_retries: row.get(13)?,
            timeout_seconds: row.get(14)?,
            expires_at: row.get(15)?,
            metadata: row.get(16)?,
        })
    }

    fn from_task(task: &ScheduledTask) -> Result<Self> {
        Ok(Self {
            task_id: task.task_id.clone(),
            job_name: task.job_name.clone(),
            schedule: serde_json::to_string(&task.schedule)?,
            args: serde_json::to_string(&task.args)?,
            kwargs: serde_json::to_string(&task.kwargs)?,
            priority: task.priority.as_str().to_string(),
            enabled: task.enabled,
            status: task.status.as_str().to_string(),
            created_at: task.created_at.to_rfc3339(),
            last_run_at: task.last_run_at.map(|t| t.to_rfc3339()),
            next_run_at: task.next_run_at.map(|t| t.to_rfc3339()),
            run_count: task.run_count,
            failure_count: task.failure_count,
            max_retries: task.max_retries,
            timeout_seconds: task
                .timeout_seconds
                .map(|s| i64::try_from(s).unwrap_or(i64::MAX)),
            expires_at: task.expires_at.map(|t| t.to_rfc3339()),
            metadata: serde_json::to_string(&task.metadata)?,
        })
    }

    fn into_task(self) -> Result<ScheduledTask> {
        Ok(ScheduledTask {
            schedule: serde_json::from_str(&self.schedule)?,
            args: serde_json::from_str(&self.args)?,
            kwargs: serde_json::from_str(&self.kwargs)?,
            priority: self.priority.parse()?,
            enabled: self.enabled,
            status: self.status.parse::<TaskStatus>()?,
            created_at: parse_ts(&self.created_at)?,
            last_run_at: self.last_run_at.as_deref().map(parse_ts).transpose()?,
            next_run_at: self.next_run_at.as_deref().map(parse_ts).transpose()?,
            run_count: self.run_count,
            failure_count: self.failure_count,
            max_retries: self.max_retries,
            timeout_seconds: self.timeout_seconds.and_then(|s| u64::try_from(s).ok()),
            expires_at: self.expires_at.as_deref().map(parse_ts).transpose()?,
            metadata: serde_json::from_str(&self.metadata)?,
            task_id: self.task_id,
            job_name: self.job_name,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| MillwrightError::store(format!("Bad timestamp '{s}': {e}")))
}

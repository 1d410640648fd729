//! Broker interface: the narrow surface the scheduler needs from the
//! distributed task system: send, revoke, and its periodic ("beat") table.
//!
//! Adapters:
//! - `MemoryBroker`: in-process, records everything (tests, dry runs)
//! - `HttpBroker`: JSON over HTTP to a broker gateway

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use millwright_core::error::{MillwrightError, Result};

use crate::beat::PeriodicEntry;
use crate::router::{Queue, RetryPolicy};

/// Broker-assigned identifier of one dispatched execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(pub String);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One execution handed to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Scheduled task this execution belongs to.
    pub task_id: String,
    pub job_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub queue: Queue,
    pub retry_policy: RetryPolicy,
    pub countdown_secs: u64,
    pub expires: Option<DateTime<Utc>>,
    pub soft_time_limit_secs: Option<u64>,
    pub rate_limit: Option<String>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue one execution.
    async fn send(&self, request: DispatchRequest) -> Result<TaskHandle>;

    async fn revoke(&self, handle: &TaskHandle, terminate: bool) -> Result<()>;

    /// Install or replace `task_id` in the periodic table.
    async fn set_periodic(&self, task_id: &str, entry: PeriodicEntry) -> Result<()>;

    /// Remove `task_id` from the periodic table. Absent keys are not an error.
    async fn remove_periodic(&self, task_id: &str) -> Result<()>;

    /// Keys currently in the periodic table.
    async fn periodic_task_ids(&self) -> Result<Vec<String>>;
}

// ─── In-process broker ───────────────────────────────────────

/// Broker that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    sent: Mutex<Vec<DispatchRequest>>,
    revoked: Mutex<Vec<(TaskHandle, bool)>>,
    periodic: Mutex<HashMap<String, PeriodicEntry>>,
    periodic_writes: AtomicUsize,
    next_handle: AtomicU64,
    fail_sends: AtomicBool,
    fail_periodic: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `send` fail (simulates a broker outage).
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent periodic-table write fail.
    pub fn set_fail_periodic(&self, fail: bool) {
        self.fail_periodic.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<DispatchRequest> {
        lock(&self.sent).clone()
    }

    pub fn revoked(&self) -> Vec<(TaskHandle, bool)> {
        lock(&self.revoked).clone()
    }

    pub fn periodic_entry(&self, task_id: &str) -> Option<PeriodicEntry> {
        lock(&self.periodic).get(task_id).cloned()
    }

    pub fn periodic_len(&self) -> usize {
        lock(&self.periodic).len()
    }

    /// Number of `set_periodic` calls so far.
    pub fn periodic_writes(&self) -> usize {
        self.periodic_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn send(&self, request: DispatchRequest) -> Result<TaskHandle> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(MillwrightError::broker("connection refused"));
        }
        let n = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = TaskHandle(format!("mem-{n}"));
        tracing::debug!(
            "📨 [memory] {} → queue '{}' as {}",
            request.job_name,
            request.queue,
            handle
        );
        lock(&self.sent).push(request);
        Ok(handle)
    }

    async fn revoke(&self, handle: &TaskHandle, terminate: bool) -> Result<()> {
        lock(&self.revoked).push((handle.clone(), terminate));
        Ok(())
    }

    async fn set_periodic(&self, task_id: &str, entry: PeriodicEntry) -> Result<()> {
        if self.fail_periodic.load(Ordering::SeqCst) {
            return Err(MillwrightError::broker("beat table unavailable"));
        }
        self.periodic_writes.fetch_add(1, Ordering::SeqCst);
        lock(&self.periodic).insert(task_id.to_string(), entry);
        Ok(())
    }

    async fn remove_periodic(&self, task_id: &str) -> Result<()> {
        if self.fail_periodic.load(Ordering::SeqCst) {
            return Err(MillwrightError::broker("beat table unavailable"));
        }
        lock(&self.periodic).remove(task_id);
        Ok(())
    }

    async fn periodic_task_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = lock(&self.periodic).keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

// ─── HTTP broker ───────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SendResponse {
    handle: String,
}

/// Talks to a broker gateway:
/// `POST /send`, `POST /revoke`, `GET /periodic`, `PUT|DELETE /periodic/{task_id}`.
#[derive(Debug, Clone)]
pub struct HttpBroker {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBroker {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MillwrightError::broker(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(MillwrightError::broker(format!("{what} failed {status}: {body}")))
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn send(&self, request: DispatchRequest) -> Result<TaskHandle> {
        let resp = self
            .client
            .post(self.endpoint("send"))
            .json(&request)
            .send()
            .await
            .map_err(|e| MillwrightError::broker(format!("send: {e}")))?;
        let body: SendResponse = Self::check(resp, "send")
            .await?
            .json()
            .await
            .map_err(|e| MillwrightError::broker(format!("send response: {e}")))?;
        Ok(TaskHandle(body.handle))
    }

    async fn revoke(&self, handle: &TaskHandle, terminate: bool) -> Result<()> {
        let resp = self
            .client
            .post(self.endpoint("revoke"))
            .json(&serde_json::json!({"handle": handle, "terminate": terminate}))
            .send()
            .await
            .map_err(|e| MillwrightError::broker(format!("revoke: {e}")))?;
        Self::check(resp, "revoke").await?;
        Ok(())
    }

    async fn set_periodic(&self, task_id: &str, entry: PeriodicEntry) -> Result<()> {
        let resp = self
            .client
            .put(self.endpoint(&format!("periodic/{task_id}")))
            .json(&entry)
            .send()
            .await
            .map_err(|e| MillwrightError::broker(format!("set periodic: {e}")))?;
        Self::check(resp, "set periodic").await?;
        Ok(())
    }

    async fn remove_periodic(&self, task_id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.endpoint(&format!("periodic/{task_id}")))
            .send()
            .await
            .map_err(|e| MillwrightError::broker(format!("remove periodic: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(resp, "remove periodic").await?;
        Ok(())
    }

    async fn periodic_task_ids(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(self.endpoint("periodic"))
            .send()
            .await
            .map_err(|e| MillwrightError::broker(format!("list periodic: {e}")))?;
        Self::check(resp, "list periodic")
            .await?
            .json()
            .await
            .map_err(|e| MillwrightError::broker(format!("list periodic response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DispatchRequest {
        DispatchRequest {
            task_id: "scheduled_1_1".into(),
            job_name: "reports.generate".into(),
            args: vec![],
            kwargs: Map::new(),
            queue: Queue::Default,
            retry_policy: RetryPolicy::default(),
            countdown_secs: 0,
            expires: None,
            soft_time_limit_secs: Some(60),
            rate_limit: None,
        }
    }

    #[tokio::test]
    async fn test_memory_broker_records_sends() {
        let broker = MemoryBroker::new();
        let first = broker.send(request()).await.unwrap();
        let second = broker.send(request()).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(broker.sent().len(), 2);

        broker.revoke(&first, true).await.unwrap();
        assert_eq!(broker.revoked(), vec![(first, true)]);
    }

    #[tokio::test]
    async fn test_memory_broker_outage() {
        let broker = MemoryBroker::new();
        broker.set_fail_sends(true);
        assert!(matches!(
            broker.send(request()).await,
            Err(MillwrightError::Broker(_))
        ));
        assert!(broker.sent().is_empty());
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_value(request()).unwrap();
        assert_eq!(json["queue"], "default");
        assert_eq!(json["soft_time_limit_secs"], 60);
        assert_eq!(json["retry_policy"]["max_retries"], 3);
    }

    #[test]
    fn test_http_endpoint_join() {
        let broker = HttpBroker::new("http://broker.local:8080/", Duration::from_secs(5)).unwrap();
        assert_eq!(broker.endpoint("send"), "http://broker.local:8080/send");
        assert_eq!(
            broker.endpoint("/periodic/scheduled_1_1"),
            "http://broker.local:8080/periodic/scheduled_1_1"
        );
    }
}

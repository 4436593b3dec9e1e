//! Deferred requests replayed when connectivity returns.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::network::Network;
use crate::request::{text_headers, RequestDescriptor};

/// Serializable copy of a request that could not be sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredRequest {
  pub method: String,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl DeferredRequest {
  pub fn from_descriptor(request: &RequestDescriptor) -> Self {
    Self {
      method: request.method.as_str().to_string(),
      url: request.url.to_string(),
      headers: text_headers(&request.headers),
      body: request.body.clone(),
    }
  }

  pub fn to_descriptor(&self) -> Result<RequestDescriptor> {
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Invalid method '{}': {}", self.method, e))?;
    let url = Url::parse(&self.url).map_err(|e| eyre!("Invalid url '{}': {}", self.url, e))?;

    let mut headers = HeaderMap::new();
    for (name, value) in &self.headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| eyre!("Invalid header name '{}': {}", name, e))?;
      let value =
        HeaderValue::from_str(value).map_err(|e| eyre!("Invalid header value: {}", e))?;
      headers.append(name, value);
    }

    let mut request = RequestDescriptor::new(method, url).with_body(self.body.clone());
    request.headers = headers;
    Ok(request)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRetryTask {
  pub id: Uuid,
  pub payload: DeferredRequest,
  pub created_at: DateTime<Utc>,
  /// Failed replays so far
  pub attempts: u32,
}

impl PendingRetryTask {
  pub fn new(payload: DeferredRequest) -> Self {
    Self {
      id: Uuid::new_v4(),
      payload,
      created_at: Utc::now(),
      attempts: 0,
    }
  }
}

/// Durable list of pending tasks.
pub trait TaskLog: Send + Sync {
  fn append(&self, task: &PendingRetryTask) -> Result<()>;

  /// All pending tasks in insertion order.
  fn pending(&self) -> Result<Vec<PendingRetryTask>>;

  fn remove(&self, id: Uuid) -> Result<()>;

  fn record_attempt(&self, id: Uuid) -> Result<()>;
}

/// Task log that lives as long as the process.
#[derive(Default)]
pub struct MemoryTaskLog {
  tasks: Mutex<Vec<PendingRetryTask>>,
}

impl MemoryTaskLog {
  pub fn new() -> Self {
    Self::default()
  }

  fn tasks(&self) -> Result<std::sync::MutexGuard<'_, Vec<PendingRetryTask>>> {
    self.tasks.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl TaskLog for MemoryTaskLog {
  fn append(&self, task: &PendingRetryTask) -> Result<()> {
    self.tasks()?.push(task.clone());
    Ok(())
  }

  fn pending(&self) -> Result<Vec<PendingRetryTask>> {
    Ok(self.tasks()?.clone())
  }

  fn remove(&self, id: Uuid) -> Result<()> {
    self.tasks()?.retain(|task| task.id != id);
    Ok(())
  }

  fn record_attempt(&self, id: Uuid) -> Result<()> {
    if let Some(task) = self.tasks()?.iter_mut().find(|task| task.id == id) {
      task.attempts += 1;
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  pub succeeded: usize,
  pub remaining: usize,
}

/// Queue of deferred requests. Tasks leave the queue only by succeeding.
#[derive(Clone)]
pub struct RetryQueue {
  log: Arc<dyn TaskLog>,
  network: Arc<dyn Network>,
  draining: Arc<tokio::sync::Mutex<()>>,
}

impl RetryQueue {
  pub fn new(log: Arc<dyn TaskLog>, network: Arc<dyn Network>) -> Self {
    Self {
      log,
      network,
      draining: Arc::new(tokio::sync::Mutex::new(())),
    }
  }

  pub fn enqueue(&self, payload: DeferredRequest) -> Result<Uuid> {
    let task = PendingRetryTask::new(payload);
    self.log.append(&task)?;
    info!(
      id = %task.id,
      method = %task.payload.method,
      url = %task.payload.url,
      "Deferred request queued"
    );
    Ok(task.id)
  }

  pub fn pending(&self) -> Result<Vec<PendingRetryTask>> {
    self.log.pending()
  }

  /// Replay every pending task in insertion order.
  ///
  /// Drains never overlap. Failures are logged and the task stays queued
  /// for the next drain.
  pub async fn drain(&self) -> DrainReport {
    let _guard = self.draining.lock().await;

    let tasks = match self.log.pending() {
      Ok(tasks) => tasks,
      Err(e) => {
        warn!(error = %e, "Failed to read retry queue");
        return DrainReport::default();
      }
    };

    let mut report = DrainReport::default();
    for task in tasks {
      if self.replay(&task).await {
        match self.log.remove(task.id) {
          Ok(()) => report.succeeded += 1,
          Err(e) => {
            warn!(id = %task.id, error = %e, "Failed to remove replayed task");
            report.remaining += 1;
          }
        }
      } else {
        if let Err(e) = self.log.record_attempt(task.id) {
          warn!(id = %task.id, error = %e, "Failed to record retry attempt");
        }
        report.remaining += 1;
      }
    }

    info!(succeeded = report.succeeded, remaining = report.remaining, "Retry queue drained");
    report
  }

  async fn replay(&self, task: &PendingRetryTask) -> bool {
    let request = match task.payload.to_descriptor() {
      Ok(request) => request,
      Err(e) => {
        warn!(id = %task.id, error = %e, "Deferred request cannot be rebuilt; keeping it");
        return false;
      }
    };

    match self.network.fetch(&request).await {
      Ok(response) if response.is_success() => {
        debug!(id = %task.id, status = response.status, "Deferred request replayed");
        true
      }
      Ok(response) => {
        warn!(id = %task.id, status = response.status, "Deferred request rejected; keeping it");
        false
      }
      Err(e) => {
        warn!(id = %task.id, error = %e, "Deferred request failed; keeping it");
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::network::testing::ScriptedNetwork;
  use std::time::Duration;

  fn deferred(path: &str) -> DeferredRequest {
    let url = Url::parse("http://localhost").unwrap().join(path).unwrap();
    let request = RequestDescriptor::new(Method::POST, url)
      .with_header(
        reqwest::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
      )
      .with_body(r#"{"name":"x"}"#);
    DeferredRequest::from_descriptor(&request)
  }

  #[test]
  fn test_deferred_request_rebuilds_descriptor() {
    let payload = deferred("/api/worlds");
    let request = payload.to_descriptor().unwrap();
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.url.path(), "/api/worlds");
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert_eq!(request.body, br#"{"name":"x"}"#);
  }

  #[test]
  fn test_deferred_request_keeps_text_headers_only() {
    let url = Url::parse("http://localhost/api/upload").unwrap();
    let request = RequestDescriptor::new(Method::PUT, url)
      .with_header(
        reqwest::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
      )
      .with_header(
        HeaderName::from_static("x-filename"),
        HeaderValue::from_bytes(b"r\xe9sum\xe9.txt").unwrap(),
      );

    let payload = DeferredRequest::from_descriptor(&request);
    assert_eq!(
      payload.headers,
      vec![("content-type".to_string(), "text/plain".to_string())]
    );
    assert!(payload.to_descriptor().is_ok());
  }

  #[tokio::test]
  async fn test_drain_keeps_failures() {
    let network = ScriptedNetwork::new();
    network.respond("/api/a", 201, "");
    network.fail("/api/b");
    network.respond("/api/c", 500, "");
    let log = Arc::new(MemoryTaskLog::new());
    let queue = RetryQueue::new(log.clone(), network.clone());

    queue.enqueue(deferred("/api/a")).unwrap();
    let b = queue.enqueue(deferred("/api/b")).unwrap();
    let c = queue.enqueue(deferred("/api/c")).unwrap();

    let report = queue.drain().await;
    assert_eq!(report, DrainReport { succeeded: 1, remaining: 2 });

    let pending = queue.pending().unwrap();
    assert_eq!(pending.iter().map(|t| t.id).collect::<Vec<_>>(), vec![b, c]);
    assert!(pending.iter().all(|t| t.attempts == 1));

    network.respond("/api/b", 200, "");
    network.respond("/api/c", 204, "");
    let report = queue.drain().await;
    assert_eq!(report, DrainReport { succeeded: 2, remaining: 0 });
    assert!(queue.pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_concurrent_drains_replay_once() {
    let network = ScriptedNetwork::new();
    network.stall("/api/a", Duration::from_millis(50), 200, "");
    network.stall("/api/b", Duration::from_millis(50), 200, "");
    let queue = RetryQueue::new(Arc::new(MemoryTaskLog::new()), network.clone());
    queue.enqueue(deferred("/api/a")).unwrap();
    queue.enqueue(deferred("/api/b")).unwrap();

    let (first, second) = tokio::join!(queue.drain(), queue.drain());
    assert_eq!(first.succeeded + second.succeeded, 2);
    assert_eq!(network.calls_to("/api/a"), 1);
    assert_eq!(network.calls_to("/api/b"), 1);
  }

  #[tokio::test]
  async fn test_sqlite_log_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let network = ScriptedNetwork::new();

    let id = {
      let storage = Arc::new(SqliteStorage::open_at(&path).unwrap());
      let queue = RetryQueue::new(storage, network.clone());
      queue.enqueue(deferred("/api/orders")).unwrap()
    };

    let storage = Arc::new(SqliteStorage::open_at(&path).unwrap());
    let queue = RetryQueue::new(storage, network.clone());
    assert_eq!(queue.drain().await.remaining, 1);

    let pending = queue.pending().unwrap();
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].attempts, 1);
    assert_eq!(pending[0].payload, deferred("/api/orders"));

    network.respond("/api/orders", 200, "");
    assert_eq!(queue.drain().await.succeeded, 1);
  }
}

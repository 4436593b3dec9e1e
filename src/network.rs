//! Network access for the layer.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::time::Duration;

use crate::cache::ResponseSnapshot;
use crate::error::FetchError;
use crate::request::{text_headers, RequestDescriptor};

/// A future resolving to a network outcome, owned so it can be spawned.
pub type FetchFuture = BoxFuture<'static, Result<ResponseSnapshot, FetchError>>;

/// Issues requests on behalf of the layer.
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, request: &RequestDescriptor) -> FetchFuture;
}

/// HTTP client wrapper
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("cachegate/", env!("CARGO_PKG_VERSION")))
      .connect_timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  fn fetch(&self, request: &RequestDescriptor) -> FetchFuture {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(request.headers.clone());
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    Box::pin(async move {
      let response = builder.send().await?;

      let status = response.status().as_u16();
      let headers = text_headers(response.headers());
      let body = response.bytes().await?.to_vec();

      Ok(ResponseSnapshot {
        status,
        headers,
        body,
      })
    })
  }
}

#[cfg(test)]
pub(crate) mod testing {
  //! Scripted network for exercising strategies without sockets.

  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::{Arc, Mutex};

  #[derive(Clone)]
  enum Script {
    Respond(ResponseSnapshot),
    Stall(Duration, ResponseSnapshot),
    Fail,
  }

  /// Responses keyed by URL path, plus call counters.
  #[derive(Default)]
  pub struct ScriptedNetwork {
    routes: Mutex<HashMap<String, Script>>,
    calls: AtomicUsize,
    calls_by_path: Mutex<HashMap<String, usize>>,
  }

  impl ScriptedNetwork {
    pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
    }

    fn set(&self, path: &str, script: Script) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(path.to_string(), script);
    }

    pub fn respond(&self, path: &str, status: u16, body: &str) {
      self.set(path, Script::Respond(ResponseSnapshot::new(status, body)));
    }

    pub fn stall(&self, path: &str, delay: Duration, status: u16, body: &str) {
      self.set(path, Script::Stall(delay, ResponseSnapshot::new(status, body)));
    }

    pub fn fail(&self, path: &str) {
      self.set(path, Script::Fail);
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, path: &str) -> usize {
      self
        .calls_by_path
        .lock()
        .unwrap()
        .get(path)
        .copied()
        .unwrap_or(0)
    }
  }

  impl Network for ScriptedNetwork {
    fn fetch(&self, request: &RequestDescriptor) -> FetchFuture {
      let path = request.url.path().to_string();
      self.calls.fetch_add(1, Ordering::SeqCst);
      *self
        .calls_by_path
        .lock()
        .unwrap()
        .entry(path.clone())
        .or_insert(0) += 1;

      let script = self.routes.lock().unwrap().get(&path).cloned();
      Box::pin(async move {
        match script {
          Some(Script::Respond(response)) => Ok(response),
          Some(Script::Stall(delay, response)) => {
            tokio::time::sleep(delay).await;
            Ok(response)
          }
          Some(Script::Fail) => Err(FetchError::Failure("connection refused".to_string())),
          None => Err(FetchError::Failure(format!("no route for {}", path))),
        }
      })
    }
  }
}

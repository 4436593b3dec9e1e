//! Management commands sent from outside the request path.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::classify::Category;
use crate::error::CommandError;
use crate::interceptor::Interceptor;
use crate::metrics::MetricsSnapshot;
use crate::push::{ActionOutcome, ClientWindow, PushDispatcher, WindowSnapshot};
use crate::request::{resolve_url, RequestDescriptor};

/// Commands accepted on the control channel, as JSON objects tagged by
/// `command`, e.g. `{"command":"clear_cache","store":"images"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
  ActivateNow,
  WarmCache {
    urls: Vec<String>,
  },
  /// Clear one store, or every store when `store` is absent
  ClearCache {
    #[serde(default)]
    store: Option<String>,
  },
  GetMetrics,
  PrefetchRoute {
    url: String,
  },
  /// A notification was clicked while `windows` were open
  NotificationClick {
    action: String,
    url: String,
    #[serde(default)]
    windows: Vec<ClientWindow>,
  },
}

impl ControlCommand {
  pub fn parse(line: &str) -> Result<Self, CommandError> {
    serde_json::from_str(line).map_err(|e| CommandError::Malformed(e.to_string()))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmFailure {
  pub url: String,
  pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ControlReply {
  Activated {
    version: String,
    purged_stores: Vec<String>,
  },
  Warmed {
    stored: usize,
    failed: Vec<WarmFailure>,
  },
  Cleared {
    stores: Vec<String>,
    removed: usize,
  },
  Metrics(MetricsSnapshot),
  Prefetched {
    url: String,
    stored: bool,
  },
  Routed {
    outcome: ActionOutcome,
  },
}

/// Executes control commands against a running layer.
#[derive(Clone)]
pub struct ControlChannel {
  interceptor: Interceptor,
  push: Arc<PushDispatcher>,
}

impl ControlChannel {
  pub fn new(interceptor: Interceptor) -> Self {
    let push = Arc::new(PushDispatcher::new(
      env!("CARGO_PKG_NAME"),
      interceptor.origin().clone(),
    ));
    Self { interceptor, push }
  }

  /// Execute one command. A rejected command leaves the layer untouched.
  pub async fn dispatch(&self, command: ControlCommand) -> Result<ControlReply, CommandError> {
    debug!(?command, "Control command received");

    match command {
      ControlCommand::ActivateNow => {
        let activation = self.interceptor.activate_now()?;
        Ok(ControlReply::Activated {
          version: activation.version,
          purged_stores: activation.purged_stores,
        })
      }
      ControlCommand::WarmCache { urls } => self.warm(urls).await,
      ControlCommand::ClearCache { store } => self.clear(store),
      ControlCommand::GetMetrics => Ok(ControlReply::Metrics(self.interceptor.metrics())),
      ControlCommand::PrefetchRoute { url } => self.prefetch(url).await,
      ControlCommand::NotificationClick {
        action,
        url,
        windows,
      } => {
        let windows = WindowSnapshot::new(windows);
        let outcome = self
          .push
          .on_action(&action, &url, &windows)
          .map_err(|e| CommandError::Routing(e.to_string()))?;
        Ok(ControlReply::Routed { outcome })
      }
    }
  }

  async fn warm(&self, urls: Vec<String>) -> Result<ControlReply, CommandError> {
    if urls.is_empty() {
      return Err(CommandError::EmptyPayload("warm_cache"));
    }

    // Validate everything before fetching anything
    let requests = urls
      .iter()
      .map(|url| self.resolve(url).map(RequestDescriptor::get))
      .collect::<Result<Vec<_>, _>>()?;

    let outcomes = join_all(requests.iter().map(|request| async move {
      let category = self.interceptor.classify(request);
      if category == Category::Sensitive {
        return Err("sensitive requests are never cached".to_string());
      }
      match self.interceptor.layer().refresh(request, category).await {
        Ok(true) => Ok(()),
        Ok(false) => Err("response was not cacheable".to_string()),
        Err(e) => Err(e.to_string()),
      }
    }))
    .await;

    let mut stored = 0;
    let mut failed = Vec::new();
    for (url, outcome) in urls.into_iter().zip(outcomes) {
      match outcome {
        Ok(()) => stored += 1,
        Err(reason) => {
          warn!(%url, %reason, "Failed to warm cache entry");
          failed.push(WarmFailure { url, reason });
        }
      }
    }

    info!(stored, failed = failed.len(), "Cache warmed");
    Ok(ControlReply::Warmed { stored, failed })
  }

  fn clear(&self, store: Option<String>) -> Result<ControlReply, CommandError> {
    let stores = self.interceptor.stores();

    match store {
      Some(name) => {
        if !stores.contains(&name) {
          return Err(CommandError::UnknownStore(name));
        }
        let removed = stores.delete_all(&name)?;
        Ok(ControlReply::Cleared {
          stores: vec![name],
          removed,
        })
      }
      None => {
        let removed = stores.clear_all()?;
        Ok(ControlReply::Cleared {
          stores: stores.names().map(String::from).collect(),
          removed,
        })
      }
    }
  }

  async fn prefetch(&self, url: String) -> Result<ControlReply, CommandError> {
    let request = RequestDescriptor::navigate(self.resolve(&url)?);
    let category = self.interceptor.classify(&request);

    let stored = match self.interceptor.layer().refresh(&request, category).await {
      Ok(stored) => stored,
      Err(e) => {
        warn!(%url, error = %e, "Prefetch failed");
        false
      }
    };

    Ok(ControlReply::Prefetched { url, stored })
  }

  fn resolve(&self, url: &str) -> Result<url::Url, CommandError> {
    resolve_url(self.interceptor.origin(), url).map_err(|e| CommandError::InvalidUrl {
      url: url.to_string(),
      reason: e.to_string(),
    })
  }

  /// Run the channel on its own task.
  pub fn spawn(self) -> ControlHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
      while let Some((command, reply)) = rx.recv().await {
        let result = self.dispatch(command).await;
        if let Err(e) = &result {
          warn!(error = %e, "Control command rejected");
        }
        // The sender may have given up waiting
        let _ = reply.send(result);
      }
      debug!("Control channel closed");
    });

    ControlHandle { tx }
  }
}

type Envelope = (
  ControlCommand,
  oneshot::Sender<Result<ControlReply, CommandError>>,
);

/// Sending side of a spawned control channel.
#[derive(Clone)]
pub struct ControlHandle {
  tx: mpsc::UnboundedSender<Envelope>,
}

impl ControlHandle {
  pub async fn send(&self, command: ControlCommand) -> Result<ControlReply, CommandError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .tx
      .send((command, reply_tx))
      .map_err(|_| CommandError::ChannelClosed)?;
    reply_rx.await.map_err(|_| CommandError::ChannelClosed)?
  }
}

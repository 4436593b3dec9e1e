//! Typed errors for the places where callers branch on the failure kind.
//!
//! Everything else (config, storage plumbing, CLI) uses `color_eyre::Result`.

use std::time::Duration;
use thiserror::Error;

/// Outcome of a network call that did not produce a response.
///
/// Both variants trigger the fallback path of a strategy and are never
/// surfaced to the caller as an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  /// The call did not complete within the strategy's time budget
  #[error("network timed out after {}ms", after.as_millis())]
  Timeout { after: Duration },

  /// Transport-level failure (connection refused, DNS, reset, ...)
  #[error("network failure: {0}")]
  Failure(String),
}

impl FetchError {
  pub fn is_timeout(&self) -> bool {
    matches!(self, FetchError::Timeout { .. })
  }
}

impl From<reqwest::Error> for FetchError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      FetchError::Timeout {
        after: Duration::ZERO,
      }
    } else {
      FetchError::Failure(err.to_string())
    }
  }
}

/// Rejection of a control channel command. The channel stays live.
#[derive(Error, Debug)]
pub enum CommandError {
  #[error("unknown cache store: {0}")]
  UnknownStore(String),

  #[error("invalid url '{url}': {reason}")]
  InvalidUrl { url: String, reason: String },

  #[error("{0} requires at least one url")]
  EmptyPayload(&'static str),

  #[error("no pending version to activate")]
  NothingPending,

  #[error("malformed command: {0}")]
  Malformed(String),

  #[error("control channel closed")]
  ChannelClosed,

  #[error("storage error: {0}")]
  Storage(String),

  #[error("notification routing failed: {0}")]
  Routing(String),
}

impl From<color_eyre::Report> for CommandError {
  fn from(report: color_eyre::Report) -> Self {
    CommandError::Storage(report.to_string())
  }
}

//! Push notification routing.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::request::resolve_url;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAction {
  pub action: String,
  pub title: String,
}

/// Inbound push payload. Every field is optional on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PushMessage {
  pub title: Option<String>,
  pub body: Option<String>,
  pub url: Option<String>,
  pub actions: Vec<PushAction>,
}

/// A notification ready to be shown, remembering where it leads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub title: String,
  pub body: String,
  pub actions: Vec<PushAction>,
  pub target_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientWindow {
  pub id: String,
  pub url: String,
}

/// Open consumers of the application.
pub trait ClientWindows: Send + Sync {
  fn list(&self) -> Vec<ClientWindow>;
  fn focus(&self, id: &str) -> Result<()>;
  /// Open a new consumer at `url`, returning its id.
  fn open(&self, url: &str) -> Result<String>;
}

/// Consumers reported by the caller at click time.
///
/// Focusing only checks the window is known; opening adds a window with a
/// fresh id so the caller can act on the decision.
#[derive(Debug, Default)]
pub struct WindowSnapshot {
  windows: Mutex<Vec<ClientWindow>>,
}

impl WindowSnapshot {
  pub fn new(windows: Vec<ClientWindow>) -> Self {
    Self {
      windows: Mutex::new(windows),
    }
  }

  fn windows(&self) -> Result<std::sync::MutexGuard<'_, Vec<ClientWindow>>> {
    self.windows.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl ClientWindows for WindowSnapshot {
  fn list(&self) -> Vec<ClientWindow> {
    match self.windows.lock() {
      Ok(windows) => windows.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  fn focus(&self, id: &str) -> Result<()> {
    if self.windows()?.iter().any(|window| window.id == id) {
      Ok(())
    } else {
      Err(eyre!("Unknown window: {}", id))
    }
  }

  fn open(&self, url: &str) -> Result<String> {
    let mut windows = self.windows()?;
    let id = format!("new-{}", windows.len());
    windows.push(ClientWindow {
      id: id.clone(),
      url: url.to_string(),
    });
    Ok(id)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "window", rename_all = "snake_case")]
pub enum ActionOutcome {
  Dismissed,
  Focused(String),
  Opened(String),
}

pub struct PushDispatcher {
  app_name: String,
  origin: Url,
}

impl PushDispatcher {
  pub fn new(app_name: &str, origin: Url) -> Self {
    Self {
      app_name: app_name.to_string(),
      origin,
    }
  }

  pub fn on_push(&self, message: PushMessage) -> NotificationAction {
    let notification = NotificationAction {
      title: message.title.unwrap_or_else(|| self.app_name.clone()),
      body: message.body.unwrap_or_default(),
      actions: message.actions,
      target_url: message.url.unwrap_or_else(|| "/".to_string()),
    };
    debug!(title = %notification.title, target = %notification.target_url, "Push received");
    notification
  }

  /// Route a notification click: focus a consumer already showing
  /// `target_url`, otherwise open one.
  pub fn on_action(
    &self,
    action: &str,
    target_url: &str,
    windows: &dyn ClientWindows,
  ) -> Result<ActionOutcome> {
    if action == "dismiss" {
      return Ok(ActionOutcome::Dismissed);
    }

    let target = self.absolute(target_url);
    if let Some(window) = windows
      .list()
      .into_iter()
      .find(|window| same_location(&self.absolute(&window.url), &target))
    {
      windows.focus(&window.id)?;
      info!(window = %window.id, url = %target, "Focused existing window");
      return Ok(ActionOutcome::Focused(window.id));
    }

    let id = windows.open(&target)?;
    info!(window = %id, url = %target, "Opened new window");
    Ok(ActionOutcome::Opened(id))
  }

  fn absolute(&self, url: &str) -> String {
    resolve_url(&self.origin, url)
      .map(|u| u.to_string())
      .unwrap_or_else(|_| url.to_string())
  }
}

fn same_location(a: &str, b: &str) -> bool {
  a.trim_end_matches('/') == b.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Default)]
  struct FakeWindows {
    open: Mutex<Vec<ClientWindow>>,
    focused: Mutex<Vec<String>>,
  }

  impl FakeWindows {
    fn with(urls: &[&str]) -> Self {
      let windows = Self::default();
      for (i, url) in urls.iter().enumerate() {
        windows.open.lock().unwrap().push(ClientWindow {
          id: format!("w{}", i),
          url: url.to_string(),
        });
      }
      windows
    }
  }

  impl ClientWindows for FakeWindows {
    fn list(&self) -> Vec<ClientWindow> {
      self.open.lock().unwrap().clone()
    }

    fn focus(&self, id: &str) -> Result<()> {
      self.focused.lock().unwrap().push(id.to_string());
      Ok(())
    }

    fn open(&self, url: &str) -> Result<String> {
      let mut open = self.open.lock().unwrap();
      let id = format!("w{}", open.len());
      open.push(ClientWindow {
        id: id.clone(),
        url: url.to_string(),
      });
      Ok(id)
    }
  }

  fn dispatcher() -> PushDispatcher {
    PushDispatcher::new("cachegate", Url::parse("http://localhost:8080").unwrap())
  }

  #[test]
  fn test_on_push_defaults() {
    let message: PushMessage = serde_json::from_str(r#"{"body":"New listing"}"#).unwrap();
    let notification = dispatcher().on_push(message);
    assert_eq!(notification.title, "cachegate");
    assert_eq!(notification.body, "New listing");
    assert_eq!(notification.target_url, "/");
    assert!(notification.actions.is_empty());
  }

  #[test]
  fn test_on_push_keeps_actions() {
    let message: PushMessage = serde_json::from_str(
      r#"{"title":"Sale","url":"/market","actions":[{"action":"view","title":"View"},{"action":"dismiss","title":"Later"}]}"#,
    )
    .unwrap();
    let notification = dispatcher().on_push(message);
    assert_eq!(notification.title, "Sale");
    assert_eq!(notification.actions.len(), 2);
    assert_eq!(notification.actions[0].action, "view");
  }

  #[test]
  fn test_focuses_matching_window() {
    let windows = FakeWindows::with(&[
      "http://localhost:8080/",
      "http://localhost:8080/market/",
    ]);
    let outcome = dispatcher().on_action("view", "/market", &windows).unwrap();

    assert_eq!(outcome, ActionOutcome::Focused("w1".to_string()));
    assert_eq!(*windows.focused.lock().unwrap(), vec!["w1".to_string()]);
    assert_eq!(windows.list().len(), 2);
  }

  #[test]
  fn test_opens_when_nothing_matches() {
    let windows = FakeWindows::with(&["http://localhost:8080/worlds"]);
    let outcome = dispatcher().on_action("view", "/market", &windows).unwrap();

    assert_eq!(outcome, ActionOutcome::Opened("w1".to_string()));
    assert_eq!(windows.list()[1].url, "http://localhost:8080/market");
    assert!(windows.focused.lock().unwrap().is_empty());
  }

  #[test]
  fn test_window_snapshot_routing() {
    let snapshot = WindowSnapshot::new(vec![ClientWindow {
      id: "tab-3".to_string(),
      url: "/market/".to_string(),
    }]);

    let outcome = dispatcher().on_action("view", "/market", &snapshot).unwrap();
    assert_eq!(outcome, ActionOutcome::Focused("tab-3".to_string()));

    let outcome = dispatcher().on_action("view", "/worlds", &snapshot).unwrap();
    assert_eq!(outcome, ActionOutcome::Opened("new-1".to_string()));
    assert_eq!(snapshot.list()[1].url, "http://localhost:8080/worlds");
    assert!(snapshot.focus("tab-9").is_err());
  }

  #[test]
  fn test_dismiss_does_not_navigate() {
    let windows = FakeWindows::default();
    let outcome = dispatcher().on_action("dismiss", "/market", &windows).unwrap();
    assert_eq!(outcome, ActionOutcome::Dismissed);
    assert!(windows.list().is_empty());
  }
}

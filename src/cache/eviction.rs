//! Periodic age-based eviction.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::stores::StoreManager;

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
  pub scanned: usize,
  pub removed: usize,
  /// Entries removed per store
  pub per_store: BTreeMap<String, usize>,
}

/// Removes entries older than their store's retention, on a fixed period.
#[derive(Clone)]
pub struct EvictionScheduler {
  stores: Arc<StoreManager>,
  interval: Duration,
}

impl EvictionScheduler {
  pub fn new(stores: Arc<StoreManager>, interval: Duration) -> Self {
    Self { stores, interval }
  }

  pub fn run_pass(&self) -> EvictionReport {
    self.run_pass_at(Utc::now())
  }

  /// Evict every entry whose age at `now` strictly exceeds its store's
  /// retention. A store that fails to scan is skipped for this pass.
  pub fn run_pass_at(&self, now: DateTime<Utc>) -> EvictionReport {
    let mut report = EvictionReport::default();

    for spec in self.stores.specs() {
      let cutoff = match now.checked_sub_signed(spec.retention) {
        Some(cutoff) => cutoff,
        None => {
          warn!(store = %spec.name, "Retention reaches past the earliest date; skipping store");
          continue;
        }
      };
      let index = match self.stores.stored_at_index(&spec.name) {
        Ok(index) => index,
        Err(e) => {
          warn!(store = %spec.name, error = %e, "Failed to scan cache store");
          continue;
        }
      };

      let mut removed = 0;
      for (key, stored_at) in &index {
        if *stored_at >= cutoff {
          continue;
        }
        // Re-checked by the backend: an entry rewritten since the scan stays
        match self.stores.delete_if_stored_before(&spec.name, key, cutoff) {
          Ok(true) => removed += 1,
          Ok(false) => {}
          Err(e) => warn!(store = %spec.name, key, error = %e, "Failed to evict entry"),
        }
      }

      report.scanned += index.len();
      report.removed += removed;
      if removed > 0 {
        report.per_store.insert(spec.name.clone(), removed);
      }
    }

    report
  }

  /// Run passes in the background: one immediately, then every interval.
  pub fn spawn(&self) -> SchedulerHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let scheduler = self.clone();

    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(scheduler.interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          biased;
          _ = &mut shutdown_rx => break,
          _ = ticker.tick() => {
            let pass = scheduler.clone();
            match tokio::task::spawn_blocking(move || pass.run_pass()).await {
              Ok(report) if report.removed > 0 => {
                info!(
                  removed = report.removed,
                  scanned = report.scanned,
                  "Evicted expired cache entries"
                );
              }
              Ok(report) => debug!(scanned = report.scanned, "Nothing to evict"),
              Err(e) => error!("Eviction pass failed: {}", e),
            }
          }
        }
      }
      debug!("Eviction scheduler stopped");
    });

    SchedulerHandle {
      shutdown: Some(shutdown_tx),
      task,
    }
  }
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
  shutdown: Option<oneshot::Sender<()>>,
  task: JoinHandle<()>,
}

impl SchedulerHandle {
  /// Stop the scheduler and wait for an in-flight pass to finish.
  pub async fn shutdown(mut self) {
    if let Some(tx) = self.shutdown.take() {
      let _ = tx.send(());
    }
    if let Err(e) = self.task.await {
      error!("Eviction scheduler task failed: {}", e);
    }
  }
}

//! Online/offline signal.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

/// Something that can tell whether the backend answers.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
  async fn is_reachable(&self) -> bool;
}

/// Publishes connectivity transitions to any number of subscribers.
pub struct NetworkMonitor {
  tx: watch::Sender<Connectivity>,
}

impl NetworkMonitor {
  pub fn new(initial: Connectivity) -> (Self, watch::Receiver<Connectivity>) {
    let (tx, rx) = watch::channel(initial);
    (Self { tx }, rx)
  }

  /// Record a probe result. Returns true when the state changed.
  pub fn report(&self, reachable: bool) -> bool {
    let next = if reachable {
      Connectivity::Online
    } else {
      Connectivity::Offline
    };

    let changed = self.tx.send_if_modified(|current| {
      if *current == next {
        false
      } else {
        *current = next;
        true
      }
    });

    if changed {
      match next {
        Connectivity::Online => info!("backend reachable, back online"),
        Connectivity::Offline => warn!("backend unreachable, switching to offline mode"),
      }
    }
    changed
  }

  /// Probe on an interval until every subscriber is gone.
  pub fn spawn<P>(self, probe: Arc<P>, interval: Duration) -> JoinHandle<()>
  where
    P: ConnectivityProbe + ?Sized + 'static,
  {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        if self.tx.is_closed() {
          break;
        }
        let reachable = probe.is_reachable().await;
        self.report(reachable);
      }
    })
  }
}

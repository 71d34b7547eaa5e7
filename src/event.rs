use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::sync::network::Connectivity;

/// Agent events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// Connectivity changed
  NetworkChanged(Connectivity),
  /// Periodic drain while online
  SyncTick,
  /// Periodic cache sweep
  CleanupTick,
  /// Ctrl-C or the network signal went away
  Shutdown,
}

/// Merges timers, connectivity transitions and shutdown into one stream
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
  tasks: Vec<JoinHandle<()>>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      tx,
      rx,
      tasks: Vec::new(),
    }
  }

  /// Emit `event` every `period`. The first tick fires after one period.
  pub fn every(&mut self, period: Duration, event: Event) {
    let tx = self.tx.clone();
    self.tasks.push(tokio::spawn(async move {
      let start = tokio::time::Instant::now() + period;
      let mut ticker = tokio::time::interval_at(start, period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        ticker.tick().await;
        if tx.send(event).is_err() {
          break;
        }
      }
    }));
  }

  /// Forward connectivity transitions.
  pub fn watch_network(&mut self, mut network: watch::Receiver<Connectivity>) {
    let tx = self.tx.clone();
    self.tasks.push(tokio::spawn(async move {
      while network.changed().await.is_ok() {
        let state = *network.borrow_and_update();
        if tx.send(Event::NetworkChanged(state)).is_err() {
          return;
        }
      }
      debug!("network signal closed");
      let _ = tx.send(Event::Shutdown);
    }));
  }

  pub fn shutdown_on_ctrl_c(&mut self) {
    let tx = self.tx.clone();
    self.tasks.push(tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = tx.send(Event::Shutdown);
      }
    }));
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for EventHandler {
  fn drop(&mut self) {
    for task in &self.tasks {
      task.abort();
    }
  }
}

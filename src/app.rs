use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::api::HttpApiClient;
use crate::cache::JsonCache;
use crate::categories::CategoryService;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::event::{Event, EventHandler};
use crate::queue::OfflineQueue;
use crate::storage::{KeyValueStorage, SqliteStorage};
use crate::sync::network::{Connectivity, NetworkMonitor};
use crate::sync::{DrainReport, Synchronizer};

/// Every long-lived component, constructed once and shared by reference
pub struct App {
  config: Config,
  storage: Arc<SqliteStorage>,
  cache: Arc<JsonCache>,
  queue: Arc<OfflineQueue>,
  api: Arc<HttpApiClient>,
  sync: Synchronizer<HttpApiClient>,
  categories: CategoryService<HttpApiClient>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let storage = Arc::new(SqliteStorage::open(
      &config.database_path()?,
      config.storage.quota_bytes,
    )?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let cache = Arc::new(JsonCache::new(
      config.cache.max_entries,
      config.cache.default_ttl(),
      clock.clone(),
    ));
    // A cold cache still works, so a failed restore only costs a refetch
    if let Err(e) = cache.restore(storage.as_ref()) {
      warn!(error = %e, "could not restore cache snapshot");
    }

    let queue = Arc::new(OfflineQueue::new(storage.clone()));
    let api = Arc::new(HttpApiClient::new(&config)?);

    let sync = Synchronizer::new(
      api.clone(),
      queue.clone(),
      cache.clone(),
      clock.clone(),
      config.sync.clone(),
    );
    let categories = CategoryService::new(api.clone(), cache.clone(), queue.clone(), clock);

    Ok(Self {
      config,
      storage,
      cache,
      queue,
      api,
      sync,
      categories,
    })
  }

  pub fn categories(&self) -> &CategoryService<HttpApiClient> {
    &self.categories
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn cache(&self) -> &JsonCache {
    &self.cache
  }

  pub fn synchronizer(&self) -> &Synchronizer<HttpApiClient> {
    &self.sync
  }

  /// Persist the valuable part of the cache for the next start.
  pub fn persist_cache(&self) -> Result<usize> {
    let storage: &dyn KeyValueStorage = self.storage.as_ref();
    Ok(self.cache.snapshot(storage, &self.config.cache.snapshot_policy())?)
  }

  /// Run the sync agent until Ctrl-C.
  ///
  /// Drains the offline queue whenever the backend becomes reachable and on
  /// a timer while it stays reachable, and sweeps the cache on its own
  /// interval. The cache is snapshotted on the way out.
  pub async fn run(&self) -> Result<()> {
    let (monitor, network) = NetworkMonitor::new(Connectivity::Offline);
    let probe = monitor.spawn(self.api.clone(), self.config.network.probe_interval());

    let mut events = EventHandler::new();
    events.watch_network(network.clone());
    events.every(self.config.sync.interval(), Event::SyncTick);
    events.every(self.config.cache.cleanup_interval(), Event::CleanupTick);
    events.shutdown_on_ctrl_c();

    info!(api = %self.config.api.url, "sync agent started");

    while let Some(event) = events.next().await {
      if !self.handle_event(event, &network).await {
        break;
      }
    }

    drop(events);
    drop(network);
    probe.abort();

    let persisted = self.persist_cache()?;
    info!(persisted, "sync agent stopped");
    Ok(())
  }

  /// Returns false when the agent should stop.
  async fn handle_event(&self, event: Event, network: &watch::Receiver<Connectivity>) -> bool {
    match event {
      Event::NetworkChanged(Connectivity::Online) => {
        self.cache.cleanup();
        self.drain_all().await;
      }
      Event::NetworkChanged(Connectivity::Offline) => {}
      Event::SyncTick => {
        if *network.borrow() == Connectivity::Online {
          self.drain_all().await;
        }
      }
      Event::CleanupTick => {
        self.cache.cleanup();
      }
      Event::Shutdown => return false,
    }
    true
  }

  async fn drain_all(&self) {
    match self.sync.drain_all().await {
      Ok(reports) => log_reports(&reports),
      Err(e) => error!(error = %e, "could not list establishments with queued work"),
    }
  }
}

fn log_reports(reports: &[DrainReport]) {
  for report in reports.iter().filter(|r| !r.dropped.is_empty()) {
    warn!(
      establishment = %report.establishment_id,
      dropped = report.dropped.len(),
      "some offline changes were discarded"
    );
  }
}

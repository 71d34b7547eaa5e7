//! Replays queued offline operations against the backend.

pub mod network;

use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{ApiError, Category, Disposition, RemoteApi};
use crate::cache::{CacheKey, JsonCache, SetOptions, Tag};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::domain::{EntityId, EstablishmentId};
use crate::queue::{Mutation, OfflineOperation, OfflineQueue, QueueError};

/// Where an operation stands after a drain cycle.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
  /// Still queued, either retried or not yet due
  Pending,
  /// Accepted by the backend and dequeued
  Applied,
  /// Dequeued without being applied
  Discarded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DropReason {
  NotFound { detail: String },
  Conflict { detail: String },
  RetriesExhausted { attempts: u32, last_error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroppedOperation {
  pub operation: OfflineOperation,
  #[serde(flatten)]
  pub reason: DropReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetriedOperation {
  pub id: Uuid,
  pub retry_count: u32,
  pub error: String,
}

/// Outcome of one drain cycle for one establishment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrainReport {
  pub establishment_id: EstablishmentId,
  /// Another drain for this establishment was already running
  pub skipped: bool,
  pub applied: Vec<Uuid>,
  pub dropped: Vec<DroppedOperation>,
  pub retried: Vec<RetriedOperation>,
  /// Left alone because their backoff has not elapsed
  pub deferred: Vec<Uuid>,
  /// Why the drain stopped early. Operations not yet reached stay queued.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl DrainReport {
  fn new(establishment_id: EstablishmentId) -> Self {
    Self {
      establishment_id,
      skipped: false,
      applied: Vec::new(),
      dropped: Vec::new(),
      retried: Vec::new(),
      deferred: Vec::new(),
      error: None,
    }
  }

  #[cfg(test)]
  pub fn state_of(&self, id: Uuid) -> Option<OperationState> {
    if self.applied.contains(&id) {
      Some(OperationState::Applied)
    } else if self.dropped.iter().any(|d| d.operation.id == id) {
      Some(OperationState::Discarded)
    } else if self.retried.iter().any(|r| r.id == id) || self.deferred.contains(&id) {
      Some(OperationState::Pending)
    } else {
      None
    }
  }

  pub fn is_empty(&self) -> bool {
    self.applied.is_empty()
      && self.dropped.is_empty()
      && self.retried.is_empty()
      && self.deferred.is_empty()
      && self.error.is_none()
  }
}

/// What a successful replay changed on the backend.
enum Applied {
  Upserted(Category),
  Deleted(EntityId),
}

/// Releases an establishment's drain slot when dropped.
struct DrainGuard<'a> {
  in_flight: &'a Mutex<HashSet<EstablishmentId>>,
  establishment: EstablishmentId,
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self
      .in_flight
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(&self.establishment);
  }
}

pub struct Synchronizer<A: ?Sized> {
  api: Arc<A>,
  queue: Arc<OfflineQueue>,
  cache: Arc<JsonCache>,
  clock: Arc<dyn Clock>,
  settings: SyncConfig,
  in_flight: Mutex<HashSet<EstablishmentId>>,
}

impl<A> Synchronizer<A>
where
  A: RemoteApi + ?Sized,
{
  pub fn new(
    api: Arc<A>,
    queue: Arc<OfflineQueue>,
    cache: Arc<JsonCache>,
    clock: Arc<dyn Clock>,
    settings: SyncConfig,
  ) -> Self {
    Self {
      api,
      queue,
      cache,
      clock,
      settings,
      in_flight: Mutex::new(HashSet::new()),
    }
  }

  fn try_begin(&self, establishment: EstablishmentId) -> Option<DrainGuard<'_>> {
    let mut in_flight = self
      .in_flight
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    if !in_flight.insert(establishment) {
      return None;
    }
    Some(DrainGuard {
      in_flight: &self.in_flight,
      establishment,
    })
  }

  /// Replay every queued operation of `establishment`, oldest first.
  ///
  /// Works on the queue as it was when the cycle started; operations queued
  /// meanwhile wait for the next cycle. Individual failures never stop the
  /// cycle, only a failure to update the queue itself does.
  pub async fn drain(&self, establishment: EstablishmentId) -> Result<DrainReport, QueueError> {
    let mut report = DrainReport::new(establishment);

    let Some(_guard) = self.try_begin(establishment) else {
      debug!(%establishment, "drain already in progress, skipping");
      report.skipped = true;
      return Ok(report);
    };

    let snapshot = self.queue.pending(establishment)?;
    if snapshot.is_empty() {
      return Ok(report);
    }
    info!(%establishment, pending = snapshot.len(), "draining offline queue");

    for operation in snapshot {
      if !operation.is_due(self.clock.now()) {
        report.deferred.push(operation.id);
        continue;
      }

      debug!(
        operation = %operation.id,
        kind = %operation.mutation.kind(),
        entity = ?operation.mutation.entity_id(),
        "replaying operation"
      );

      match self.replay(&operation).await {
        Ok(applied) => {
          self.queue.dequeue(establishment, operation.id)?;
          self.merge(establishment, applied);
          report.applied.push(operation.id);
        }
        Err(err) => self.handle_failure(operation, err, &mut report)?,
      }
    }

    info!(
      %establishment,
      applied = report.applied.len(),
      dropped = report.dropped.len(),
      retried = report.retried.len(),
      deferred = report.deferred.len(),
      "drain finished"
    );
    Ok(report)
  }

  /// Drain every establishment that has queued work.
  ///
  /// A failure in one establishment's queue is recorded in its report and
  /// the remaining establishments are still drained.
  pub async fn drain_all(&self) -> Result<Vec<DrainReport>, QueueError> {
    let mut reports = Vec::new();
    for establishment in self.queue.establishments()? {
      match self.drain(establishment).await {
        Ok(report) => reports.push(report),
        Err(err) => {
          error!(%establishment, error = %err, "drain failed");
          let mut report = DrainReport::new(establishment);
          report.error = Some(err.to_string());
          reports.push(report);
        }
      }
    }
    Ok(reports)
  }

  async fn replay(&self, operation: &OfflineOperation) -> Result<Applied, ApiError> {
    let establishment = operation.establishment_id;
    let call = async {
      match &operation.mutation {
        Mutation::Create { payload } => self
          .api
          .create(establishment, payload)
          .await
          .map(Applied::Upserted),
        Mutation::Update { entity_id, payload } => self
          .api
          .update(establishment, *entity_id, payload)
          .await
          .map(Applied::Upserted),
        Mutation::Delete { entity_id } => self
          .api
          .delete(establishment, *entity_id)
          .await
          .map(|()| Applied::Deleted(*entity_id)),
      }
    };

    match tokio::time::timeout(self.settings.request_timeout(), call).await {
      Ok(result) => result,
      Err(_) => Err(ApiError::Timeout),
    }
  }

  fn handle_failure(
    &self,
    operation: OfflineOperation,
    err: ApiError,
    report: &mut DrainReport,
  ) -> Result<(), QueueError> {
    let establishment = operation.establishment_id;
    let attempts = operation.retry_count + 1;

    let reason = match (err.disposition(), &err) {
      (Disposition::Discard, ApiError::NotFound(detail)) => DropReason::NotFound {
        detail: detail.clone(),
      },
      (Disposition::Discard, _) => DropReason::Conflict {
        detail: err.to_string(),
      },
      (Disposition::Retry, _) if self.settings.max_retries > 0 && attempts >= self.settings.max_retries => {
        DropReason::RetriesExhausted {
          attempts,
          last_error: err.to_string(),
        }
      }
      (Disposition::Retry, _) => {
        let backoff = self.settings.backoff(attempts);
        let next_attempt_at = (!backoff.is_zero())
          .then(|| chrono::Duration::from_std(backoff).ok())
          .flatten()
          .map(|b| self.clock.now() + b);

        let error = err.to_string();
        if let Some(retry_count) =
          self
            .queue
            .increment_retry(establishment, operation.id, &error, next_attempt_at)?
        {
          debug!(operation = %operation.id, retry_count, %error, "replay failed, will retry");
          report.retried.push(RetriedOperation {
            id: operation.id,
            retry_count,
            error,
          });
        }
        return Ok(());
      }
    };

    self.queue.dequeue(establishment, operation.id)?;
    warn!(
      operation = %operation.id,
      kind = %operation.mutation.kind(),
      %establishment,
      ?reason,
      "discarded offline operation that can no longer be applied"
    );
    report.dropped.push(DroppedOperation { operation, reason });
    Ok(())
  }

  /// Reflect an applied operation in the cache.
  fn merge(&self, establishment: EstablishmentId, applied: Applied) {
    let id = match &applied {
      Applied::Upserted(category) => category.id,
      Applied::Deleted(id) => *id,
    };

    self.cache.invalidate_by_tags(&[
      Tag::category(establishment, id),
      Tag::category_list(establishment),
    ]);

    if let Applied::Upserted(category) = applied {
      match serde_json::to_value(&category) {
        Ok(value) => self
          .cache
          .set(CacheKey::category(establishment, id), value, SetOptions::new()),
        Err(e) => warn!(error = %e, "could not cache replayed category"),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::mock::{Call, MockApi};
  use crate::clock::ManualClock;
  use crate::storage::{KeyValueStorage, SqliteStorage};
  use chrono::Utc;
  use serde_json::{json, Value};
  use std::time::Duration;

  struct Fixture {
    api: Arc<MockApi>,
    storage: Arc<SqliteStorage>,
    queue: Arc<OfflineQueue>,
    cache: Arc<JsonCache>,
    clock: Arc<ManualClock>,
    sync: Arc<Synchronizer<MockApi>>,
  }

  fn settings() -> SyncConfig {
    SyncConfig {
      backoff_base_ms: 0,
      backoff_max_ms: 0,
      request_timeout_ms: 1_000,
      ..SyncConfig::default()
    }
  }

  fn fixture_with(settings: SyncConfig) -> Fixture {
    let clock = Arc::new(ManualClock::new());
    let api = Arc::new(MockApi::new());
    let storage = Arc::new(SqliteStorage::open_in_memory(None).unwrap());
    let queue = Arc::new(OfflineQueue::new(storage.clone()));
    let cache = Arc::new(JsonCache::new(100, Duration::from_secs(300), clock.clone()));
    let sync = Arc::new(Synchronizer::new(
      api.clone(),
      queue.clone(),
      cache.clone(),
      clock.clone(),
      settings,
    ));
    Fixture {
      api,
      storage,
      queue,
      cache,
      clock,
      sync,
    }
  }

  fn fixture() -> Fixture {
    fixture_with(settings())
  }

  fn enqueue(f: &Fixture, est: u64, mutation: Mutation) -> OfflineOperation {
    let op = OfflineOperation::new(EstablishmentId(est), mutation, Utc::now());
    f.queue.enqueue(op.clone()).unwrap();
    op
  }

  fn create(name: &str) -> Mutation {
    Mutation::Create {
      payload: json!({ "nome": name }),
    }
  }

  fn seed(f: &Fixture, est: u64, id: u64, name: &str) {
    f.api.seed(
      EstablishmentId(est),
      Category {
        id: EntityId(id),
        name: name.to_string(),
        description: None,
        active: true,
      },
    );
  }

  #[tokio::test]
  async fn test_replays_in_fifo_order() {
    let f = fixture();
    seed(&f, 1, 10, "Pratos");
    let o1 = enqueue(&f, 1, create("Bebidas"));
    let o2 = enqueue(
      &f,
      1,
      Mutation::Update {
        entity_id: EntityId(10),
        payload: json!({"nome": "Pratos quentes"}),
      },
    );
    let o3 = enqueue(
      &f,
      1,
      Mutation::Delete {
        entity_id: EntityId(10),
      },
    );

    let report = f.sync.drain(EstablishmentId(1)).await.unwrap();

    let est = EstablishmentId(1);
    assert_eq!(
      f.api.calls(),
      vec![
        Call::Create(est, json!({"nome": "Bebidas"})),
        Call::Update(est, EntityId(10), json!({"nome": "Pratos quentes"})),
        Call::Delete(est, EntityId(10)),
      ]
    );
    assert_eq!(report.applied, vec![o1.id, o2.id, o3.id]);
    assert_eq!(f.queue.len(est).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_transient_failure_stays_queued_others_proceed() {
    let f = fixture();
    let o1 = enqueue(&f, 1, create("a"));
    let o2 = enqueue(&f, 1, create("b"));
    let o3 = enqueue(&f, 1, create("c"));
    f.api
      .script([None, Some(ApiError::Transient("503".into())), None]);

    let report = f.sync.drain(EstablishmentId(1)).await.unwrap();

    let pending = f.queue.pending(EstablishmentId(1)).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, o2.id);
    assert_eq!(pending[0].retry_count, 1);
    assert_eq!(report.state_of(o1.id), Some(OperationState::Applied));
    assert_eq!(report.state_of(o2.id), Some(OperationState::Pending));
    assert_eq!(report.state_of(o3.id), Some(OperationState::Applied));
  }

  #[tokio::test]
  async fn test_not_found_is_discarded_without_retry() {
    let f = fixture();
    let op = enqueue(
      &f,
      1,
      Mutation::Update {
        entity_id: EntityId(99),
        payload: json!({"nome": "x"}),
      },
    );

    let report = f.sync.drain(EstablishmentId(1)).await.unwrap();

    assert_eq!(f.api.calls().len(), 1);
    assert_eq!(f.queue.len(EstablishmentId(1)).unwrap(), 0);
    assert!(report.retried.is_empty());
    assert_eq!(report.dropped.len(), 1);
    assert_eq!(report.dropped[0].operation.retry_count, 0);
    assert!(matches!(report.dropped[0].reason, DropReason::NotFound { .. }));
    assert_eq!(report.state_of(op.id), Some(OperationState::Discarded));
  }

  #[tokio::test]
  async fn test_conflict_is_discarded() {
    let f = fixture();
    enqueue(&f, 1, create("Bebidas"));
    f.api.script([Some(ApiError::Conflict("duplicate".into()))]);

    let report = f.sync.drain(EstablishmentId(1)).await.unwrap();

    assert!(matches!(report.dropped[0].reason, DropReason::Conflict { .. }));
    assert_eq!(f.queue.len(EstablishmentId(1)).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_unauthorized_is_retried() {
    let f = fixture();
    enqueue(&f, 1, create("Bebidas"));
    f.api.script([Some(ApiError::Unauthorized)]);

    let report = f.sync.drain(EstablishmentId(1)).await.unwrap();

    assert_eq!(report.retried.len(), 1);
    assert_eq!(f.queue.len(EstablishmentId(1)).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_retries_exhausted_discards() {
    let f = fixture_with(SyncConfig {
      max_retries: 2,
      ..settings()
    });
    let op = enqueue(&f, 1, create("a"));
    f.api.script([
      Some(ApiError::Transient("503".into())),
      Some(ApiError::Transient("503".into())),
    ]);

    let first = f.sync.drain(EstablishmentId(1)).await.unwrap();
    assert_eq!(first.state_of(op.id), Some(OperationState::Pending));

    let second = f.sync.drain(EstablishmentId(1)).await.unwrap();
    assert_eq!(second.state_of(op.id), Some(OperationState::Discarded));
    assert!(matches!(
      second.dropped[0].reason,
      DropReason::RetriesExhausted { attempts: 2, .. }
    ));
    assert_eq!(f.queue.len(EstablishmentId(1)).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_backoff_defers_until_due() {
    let f = fixture_with(SyncConfig {
      backoff_base_ms: 1_000,
      backoff_max_ms: 10_000,
      ..settings()
    });
    let op = enqueue(&f, 1, create("a"));
    f.api.script([Some(ApiError::Transient("503".into()))]);

    f.sync.drain(EstablishmentId(1)).await.unwrap();

    let deferred = f.sync.drain(EstablishmentId(1)).await.unwrap();
    assert_eq!(deferred.deferred, vec![op.id]);
    assert_eq!(f.api.calls().len(), 1);

    f.clock.advance(Duration::from_millis(1_000));
    let applied = f.sync.drain(EstablishmentId(1)).await.unwrap();
    assert_eq!(applied.applied, vec![op.id]);
  }

  #[tokio::test]
  async fn test_timeout_counts_as_transient() {
    let f = fixture_with(SyncConfig {
      request_timeout_ms: 20,
      ..settings()
    });
    f.api.set_delay(Duration::from_millis(500));
    enqueue(&f, 1, create("a"));

    let report = f.sync.drain(EstablishmentId(1)).await.unwrap();

    assert_eq!(report.retried.len(), 1);
    assert_eq!(report.retried[0].error, ApiError::Timeout.to_string());
    assert_eq!(f.queue.len(EstablishmentId(1)).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_drain_is_suppressed() {
    let f = fixture();
    f.api.set_delay(Duration::from_millis(50));
    enqueue(&f, 1, create("a"));

    let (first, second) = tokio::join!(
      f.sync.drain(EstablishmentId(1)),
      f.sync.drain(EstablishmentId(1))
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(!first.skipped);
    assert_eq!(first.applied.len(), 1);
    assert!(second.skipped);
    assert_eq!(f.api.calls().len(), 1);

    // The slot is released once the first drain finishes
    let third = f.sync.drain(EstablishmentId(1)).await.unwrap();
    assert!(!third.skipped);
  }

  #[tokio::test]
  async fn test_other_establishments_drain_independently() {
    let f = fixture();
    f.api.set_delay(Duration::from_millis(20));
    enqueue(&f, 1, create("a"));
    enqueue(&f, 2, create("b"));

    let (one, two) = tokio::join!(
      f.sync.drain(EstablishmentId(1)),
      f.sync.drain(EstablishmentId(2))
    );
    assert!(!one.unwrap().skipped);
    assert!(!two.unwrap().skipped);
  }

  #[tokio::test]
  async fn test_operations_enqueued_mid_drain_wait_for_next_cycle() {
    let f = fixture();
    f.api.set_delay(Duration::from_millis(30));
    enqueue(&f, 1, create("a"));

    let sync = f.sync.clone();
    let drain = tokio::spawn(async move { sync.drain(EstablishmentId(1)).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let late = enqueue(&f, 1, create("late"));

    let report = drain.await.unwrap().unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(f.queue.pending(EstablishmentId(1)).unwrap()[0].id, late.id);
  }

  #[tokio::test]
  async fn test_success_updates_cache() {
    let f = fixture();
    let est = EstablishmentId(1);
    f.cache.set(
      CacheKey::category_list(est),
      json!([]),
      SetOptions::new(),
    );
    f.cache.set(
      CacheKey::category_list(EstablishmentId(2)),
      json!([]),
      SetOptions::new(),
    );
    enqueue(&f, 1, create("Bebidas"));

    f.sync.drain(est).await.unwrap();

    assert_eq!(f.cache.get(&CacheKey::category_list(est)), None);
    assert!(f
      .cache
      .get(&CacheKey::category_list(EstablishmentId(2)))
      .is_some());
    let cached: Value = f.cache.get(&CacheKey::category(est, EntityId(1))).unwrap();
    assert_eq!(cached["nome"], "Bebidas");
  }

  #[tokio::test]
  async fn test_delete_removes_cached_entity() {
    let f = fixture();
    let est = EstablishmentId(1);
    seed(&f, 1, 5, "Old");
    f.cache.set(CacheKey::category(est, EntityId(5)), json!({"id": 5}), SetOptions::new());
    enqueue(
      &f,
      1,
      Mutation::Delete {
        entity_id: EntityId(5),
      },
    );

    f.sync.drain(est).await.unwrap();

    assert_eq!(f.cache.get(&CacheKey::category(est, EntityId(5))), None);
  }

  #[tokio::test]
  async fn test_drain_all_and_empty_queue() {
    let f = fixture();
    let empty = f.sync.drain(EstablishmentId(3)).await.unwrap();
    assert!(empty.is_empty());
    assert!(f.api.calls().is_empty());

    enqueue(&f, 1, create("a"));
    enqueue(&f, 2, create("b"));
    let reports = f.sync.drain_all().await.unwrap();

    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.applied.len() == 1));
    assert!(f.queue.establishments().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_drain_all_continues_past_unreadable_queue() {
    let f = fixture();
    f.storage.set("offline-queue:1", "garbage").unwrap();
    let op = enqueue(&f, 2, create("Bebidas"));

    let reports = f.sync.drain_all().await.unwrap();

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].establishment_id, EstablishmentId(1));
    assert!(reports[0].error.is_some());
    assert!(!reports[0].is_empty());
    assert_eq!(reports[1].establishment_id, EstablishmentId(2));
    assert_eq!(reports[1].applied, vec![op.id]);
    assert_eq!(reports[1].error, None);
    assert_eq!(f.queue.len(EstablishmentId(2)).unwrap(), 0);
    assert_eq!(
      f.storage.get("offline-queue:1").unwrap().as_deref(),
      Some("garbage")
    );
  }

  #[tokio::test]
  async fn test_offline_create_end_to_end() {
    let f = fixture();
    let est = EstablishmentId(1);
    f.api.set_offline(true);

    // While offline the replay fails and the operation stays put
    enqueue(&f, 1, create("Bebidas"));
    let offline = f.sync.drain(est).await.unwrap();
    assert_eq!(offline.retried.len(), 1);

    f.api.set_offline(false);
    let report = f.sync.drain(est).await.unwrap();

    assert_eq!(f.api.calls(), vec![Call::Create(est, json!({"nome": "Bebidas"}))]);
    assert_eq!(report.applied.len(), 1);
    assert_eq!(f.queue.len(est).unwrap(), 0);
  }
}

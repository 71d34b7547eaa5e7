//! Category access with transparent caching and offline writes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::{ApiError, Category, CategoryDraft, RemoteApi};
use crate::cache::{CacheKey, JsonCache, Priority, SetOptions, Tag};
use crate::clock::Clock;
use crate::domain::{EntityId, EstablishmentId};
use crate::queue::{Mutation, OfflineOperation, OfflineQueue, QueueError};

/// Derived figures change as often as the listing, but are cheap to rebuild.
const STATS_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum CategoryError {
  #[error(transparent)]
  Api(#[from] ApiError),

  #[error("could not queue offline change: {0}")]
  Queue(#[from] QueueError),

  #[error("malformed category data: {0}")]
  Decode(#[from] serde_json::Error),

  #[error("category {id} not found in establishment {establishment}")]
  NotFound {
    establishment: EstablishmentId,
    id: EntityId,
  },
}

/// Result of a write.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<T> {
  /// The backend accepted the change
  Applied(T),
  /// The backend was unreachable; the change waits in the offline queue.
  /// `optimistic` is what the caller should display meanwhile.
  Queued { operation_id: Uuid, optimistic: Value },
}

/// Listing filter. Each distinct filter is cached separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryFilter {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub active: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name_contains: Option<String>,
}

impl CategoryFilter {
  fn matches(&self, category: &Category) -> bool {
    if self.active.is_some_and(|active| active != category.active) {
      return false;
    }
    match &self.name_contains {
      Some(needle) => category
        .name
        .to_lowercase()
        .contains(&needle.to_lowercase()),
      None => true,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStats {
  pub total: usize,
  pub active: usize,
  pub inactive: usize,
}

/// Category client for one backend, with caching and offline support.
///
/// Reads go to the cache first. Writes go straight to the backend; when it
/// cannot be reached the change is queued for the synchronizer and an
/// optimistic value is returned instead.
pub struct CategoryService<A: ?Sized> {
  api: Arc<A>,
  cache: Arc<JsonCache>,
  queue: Arc<OfflineQueue>,
  clock: Arc<dyn Clock>,
}

impl<A> CategoryService<A>
where
  A: RemoteApi + ?Sized,
{
  pub fn new(
    api: Arc<A>,
    cache: Arc<JsonCache>,
    queue: Arc<OfflineQueue>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      api,
      cache,
      queue,
      clock,
    }
  }

  /// All categories of an establishment.
  pub async fn list(&self, establishment: EstablishmentId) -> Result<Vec<Category>, CategoryError> {
    let key = CacheKey::category_list(establishment);
    if let Some(cached) = self.cache.get(&key) {
      return Ok(serde_json::from_value(cached)?);
    }

    let categories = self.api.list(establishment).await?;
    self.cache.set(
      key,
      serde_json::to_value(&categories)?,
      SetOptions::new().priority(Priority::High),
    );
    Ok(categories)
  }

  /// Categories matching `filter`, cached per filter.
  pub async fn search(
    &self,
    establishment: EstablishmentId,
    filter: &CategoryFilter,
  ) -> Result<Vec<Category>, CategoryError> {
    let key = CacheKey::category_list(establishment).with_params(filter)?;
    if let Some(cached) = self.cache.get(&key) {
      return Ok(serde_json::from_value(cached)?);
    }

    let matching: Vec<Category> = self
      .list(establishment)
      .await?
      .into_iter()
      .filter(|c| filter.matches(c))
      .collect();
    self
      .cache
      .set(key, serde_json::to_value(&matching)?, SetOptions::new());
    Ok(matching)
  }

  /// One category. Served from its own entry or from the listing.
  pub async fn get(
    &self,
    establishment: EstablishmentId,
    id: EntityId,
  ) -> Result<Category, CategoryError> {
    let key = CacheKey::category(establishment, id);
    if let Some(cached) = self.cache.get(&key) {
      return Ok(serde_json::from_value(cached)?);
    }

    let category = self
      .list(establishment)
      .await?
      .into_iter()
      .find(|c| c.id == id)
      .ok_or(CategoryError::NotFound { establishment, id })?;
    self
      .cache
      .set(key, serde_json::to_value(&category)?, SetOptions::new());
    Ok(category)
  }

  pub async fn stats(&self, establishment: EstablishmentId) -> Result<CategoryStats, CategoryError> {
    let key = CacheKey::category_stats(establishment);
    if let Some(cached) = self.cache.get(&key) {
      return Ok(serde_json::from_value(cached)?);
    }

    let categories = self.list(establishment).await?;
    let active = categories.iter().filter(|c| c.active).count();
    let stats = CategoryStats {
      total: categories.len(),
      active,
      inactive: categories.len() - active,
    };
    self.cache.set(
      key,
      serde_json::to_value(stats)?,
      SetOptions::new().ttl(STATS_TTL).priority(Priority::Low),
    );
    Ok(stats)
  }

  pub async fn create(
    &self,
    establishment: EstablishmentId,
    draft: &CategoryDraft,
  ) -> Result<MutationOutcome<Category>, CategoryError> {
    let payload = serde_json::to_value(draft)?;
    if !self.has_backlog(establishment)? {
      match self.api.create(establishment, &payload).await {
        Ok(category) => {
          self.remember(establishment, &category)?;
          info!(%establishment, id = %category.id, "category created");
          return Ok(MutationOutcome::Applied(category));
        }
        Err(err) if err.is_offline() => {}
        Err(err) => return Err(err.into()),
      }
    }
    let optimistic = payload.clone();
    self.defer(establishment, Mutation::Create { payload }, optimistic)
  }

  pub async fn update(
    &self,
    establishment: EstablishmentId,
    id: EntityId,
    draft: &CategoryDraft,
  ) -> Result<MutationOutcome<Category>, CategoryError> {
    let payload = serde_json::to_value(draft)?;
    if !self.has_backlog(establishment)? {
      match self.api.update(establishment, id, &payload).await {
        Ok(category) => {
          self.remember(establishment, &category)?;
          info!(%establishment, %id, "category updated");
          return Ok(MutationOutcome::Applied(category));
        }
        Err(err) if err.is_offline() => {}
        Err(err) => return Err(err.into()),
      }
    }
    let optimistic = self.patched(establishment, id, &payload);
    self.defer(
      establishment,
      Mutation::Update {
        entity_id: id,
        payload,
      },
      optimistic,
    )
  }

  pub async fn delete(
    &self,
    establishment: EstablishmentId,
    id: EntityId,
  ) -> Result<MutationOutcome<()>, CategoryError> {
    if !self.has_backlog(establishment)? {
      match self.api.delete(establishment, id).await {
        Ok(()) => {
          self.forget(establishment, id);
          info!(%establishment, %id, "category deleted");
          return Ok(MutationOutcome::Applied(()));
        }
        Err(err) if err.is_offline() => {}
        Err(err) => return Err(err.into()),
      }
    }
    self.defer(establishment, Mutation::Delete { entity_id: id }, Value::Null)
  }

  /// Writes must not overtake changes still waiting to be replayed, so while
  /// an establishment has queued work every new write joins the queue.
  fn has_backlog(&self, establishment: EstablishmentId) -> Result<bool, CategoryError> {
    let queued = self.queue.len(establishment)?;
    if queued > 0 {
      debug!(%establishment, queued, "queueing write behind pending changes");
    }
    Ok(queued > 0)
  }

  /// Queue a mutation that could not reach the backend.
  fn defer<T>(
    &self,
    establishment: EstablishmentId,
    mutation: Mutation,
    optimistic: Value,
  ) -> Result<MutationOutcome<T>, CategoryError> {
    let operation = OfflineOperation::new(establishment, mutation, self.clock.now());
    let operation_id = operation.id;
    self.queue.enqueue(operation)?;
    Ok(MutationOutcome::Queued {
      operation_id,
      optimistic,
    })
  }

  /// Cached copy of a category with `payload` applied on top, or the payload
  /// alone when nothing is cached.
  fn patched(&self, establishment: EstablishmentId, id: EntityId, payload: &Value) -> Value {
    let Some(mut current) = self.cache.get(&CacheKey::category(establishment, id)) else {
      return payload.clone();
    };
    if let (Some(target), Some(changes)) = (current.as_object_mut(), payload.as_object()) {
      for (field, value) in changes {
        target.insert(field.clone(), value.clone());
      }
    }
    current
  }

  fn remember(&self, establishment: EstablishmentId, category: &Category) -> Result<(), CategoryError> {
    self.forget(establishment, category.id);
    self.cache.set(
      CacheKey::category(establishment, category.id),
      serde_json::to_value(category)?,
      SetOptions::new(),
    );
    Ok(())
  }

  fn forget(&self, establishment: EstablishmentId, id: EntityId) {
    let removed = self.cache.invalidate_by_tags(&[
      Tag::category(establishment, id),
      Tag::category_list(establishment),
    ]);
    debug!(%establishment, %id, removed, "invalidated cached categories");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::mock::{Call, MockApi};
  use crate::clock::ManualClock;
  use crate::config::SyncConfig;
  use crate::storage::SqliteStorage;
  use crate::sync::Synchronizer;
  use serde_json::json;

  struct Fixture {
    api: Arc<MockApi>,
    cache: Arc<JsonCache>,
    queue: Arc<OfflineQueue>,
    clock: Arc<ManualClock>,
    service: CategoryService<MockApi>,
  }

  fn fixture() -> Fixture {
    let clock = Arc::new(ManualClock::new());
    let api = Arc::new(MockApi::new());
    let cache = Arc::new(JsonCache::new(100, Duration::from_secs(300), clock.clone()));
    let queue = Arc::new(OfflineQueue::new(Arc::new(
      SqliteStorage::open_in_memory(None).unwrap(),
    )));
    let service = CategoryService::new(api.clone(), cache.clone(), queue.clone(), clock.clone());
    Fixture {
      api,
      cache,
      queue,
      clock,
      service,
    }
  }

  fn category(id: u64, name: &str, active: bool) -> Category {
    Category {
      id: EntityId(id),
      name: name.to_string(),
      description: None,
      active,
    }
  }

  fn list_calls(api: &MockApi) -> usize {
    api
      .calls()
      .iter()
      .filter(|c| matches!(c, Call::List(_)))
      .count()
  }

  #[tokio::test]
  async fn test_list_is_served_from_cache() {
    let f = fixture();
    let est = EstablishmentId(1);
    f.api.seed(est, category(1, "Bebidas", true));

    let first = f.service.list(est).await.unwrap();
    let second = f.service.list(est).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(list_calls(&f.api), 1);
    assert_eq!(f.cache.stats().hits, 1);
  }

  #[tokio::test]
  async fn test_list_refetches_after_ttl() {
    let f = fixture();
    let est = EstablishmentId(1);

    f.service.list(est).await.unwrap();
    f.clock.advance(Duration::from_secs(301));
    f.service.list(est).await.unwrap();

    assert_eq!(list_calls(&f.api), 2);
  }

  #[tokio::test]
  async fn test_get_and_stats_use_listing() {
    let f = fixture();
    let est = EstablishmentId(1);
    f.api.seed(est, category(1, "Bebidas", true));
    f.api.seed(est, category(2, "Sobremesas", false));

    let found = f.service.get(est, EntityId(2)).await.unwrap();
    assert_eq!(found.name, "Sobremesas");

    let missing = f.service.get(est, EntityId(9)).await.unwrap_err();
    assert!(matches!(missing, CategoryError::NotFound { .. }));

    let stats = f.service.stats(est).await.unwrap();
    assert_eq!(
      stats,
      CategoryStats {
        total: 2,
        active: 1,
        inactive: 1
      }
    );
    assert_eq!(list_calls(&f.api), 1);
  }

  #[tokio::test]
  async fn test_search_caches_per_filter() {
    let f = fixture();
    let est = EstablishmentId(1);
    f.api.seed(est, category(1, "Bebidas", true));
    f.api.seed(est, category(2, "Bebidas quentes", false));

    let active = CategoryFilter {
      active: Some(true),
      ..Default::default()
    };
    let named = CategoryFilter {
      name_contains: Some("QUENTES".into()),
      ..Default::default()
    };

    assert_eq!(f.service.search(est, &active).await.unwrap().len(), 1);
    assert_eq!(f.service.search(est, &named).await.unwrap()[0].id, EntityId(2));
    // listing + two filtered views
    assert_eq!(f.cache.len(), 3);
  }

  #[tokio::test]
  async fn test_online_create_invalidates_listing() {
    let f = fixture();
    let est = EstablishmentId(1);
    f.service.list(est).await.unwrap();
    f.service
      .search(est, &CategoryFilter::default())
      .await
      .unwrap();

    let outcome = f
      .service
      .create(est, &CategoryDraft::named("Bebidas"))
      .await
      .unwrap();

    let MutationOutcome::Applied(created) = outcome else {
      panic!("expected applied outcome");
    };
    assert_eq!(f.cache.get(&CacheKey::category_list(est)), None);
    assert!(f.cache.get(&CacheKey::category(est, created.id)).is_some());
    assert_eq!(f.service.list(est).await.unwrap(), vec![created]);
    assert_eq!(f.queue.len(est).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_offline_update_is_queued_with_optimistic_value() {
    let f = fixture();
    let est = EstablishmentId(1);
    f.api.seed(est, category(3, "Bebidas", true));
    f.service.get(est, EntityId(3)).await.unwrap();
    f.api.set_offline(true);

    let draft = CategoryDraft {
      active: Some(false),
      ..Default::default()
    };
    let outcome = f.service.update(est, EntityId(3), &draft).await.unwrap();

    let MutationOutcome::Queued { optimistic, .. } = outcome else {
      panic!("expected queued outcome");
    };
    assert_eq!(optimistic["nome"], "Bebidas");
    assert_eq!(optimistic["ativo"], false);
    assert_eq!(f.queue.len(est).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_non_network_failure_is_not_queued() {
    let f = fixture();
    let est = EstablishmentId(1);

    let err = f.service.delete(est, EntityId(42)).await.unwrap_err();

    assert!(matches!(err, CategoryError::Api(ApiError::NotFound(_))));
    assert_eq!(f.queue.len(est).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_offline_create_replayed_after_reconnect() {
    let f = fixture();
    let est = EstablishmentId(1);
    f.api.set_offline(true);

    let outcome = f
      .service
      .create(est, &CategoryDraft::named("Bebidas"))
      .await
      .unwrap();
    let MutationOutcome::Queued {
      operation_id,
      optimistic,
    } = outcome
    else {
      panic!("expected queued outcome");
    };
    assert_eq!(optimistic, json!({"nome": "Bebidas"}));

    let queued = f.queue.pending(est).unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, operation_id);
    assert_eq!(
      queued[0].mutation,
      Mutation::Create {
        payload: json!({"nome": "Bebidas"})
      }
    );

    f.api.set_offline(false);
    let sync = Synchronizer::new(
      f.api.clone(),
      f.queue.clone(),
      f.cache.clone(),
      f.clock.clone(),
      SyncConfig::default(),
    );
    let report = sync.drain(est).await.unwrap();

    assert_eq!(report.applied, vec![operation_id]);
    assert_eq!(f.queue.len(est).unwrap(), 0);
    assert_eq!(f.api.calls(), vec![Call::Create(est, json!({"nome": "Bebidas"}))]);
    let listed = f.service.list(est).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "Bebidas");
  }

  #[tokio::test]
  async fn test_online_write_waits_behind_queued_changes() {
    let f = fixture();
    let est = EstablishmentId(1);
    f.api.seed(est, category(7, "Pratos", true));

    f.api.set_offline(true);
    let first = f
      .service
      .update(est, EntityId(7), &CategoryDraft::named("Pratos frios"))
      .await
      .unwrap();
    assert!(matches!(first, MutationOutcome::Queued { .. }));

    // Back online, but the earlier change has not been replayed yet
    f.api.set_offline(false);
    let second = f
      .service
      .update(est, EntityId(7), &CategoryDraft::named("Pratos quentes"))
      .await
      .unwrap();
    assert!(matches!(second, MutationOutcome::Queued { .. }));
    assert!(f.api.calls().is_empty());

    let queued: Vec<Mutation> = f
      .queue
      .pending(est)
      .unwrap()
      .into_iter()
      .map(|op| op.mutation)
      .collect();
    assert_eq!(
      queued,
      vec![
        Mutation::Update {
          entity_id: EntityId(7),
          payload: json!({"nome": "Pratos frios"}),
        },
        Mutation::Update {
          entity_id: EntityId(7),
          payload: json!({"nome": "Pratos quentes"}),
        },
      ]
    );

    let sync = Synchronizer::new(
      f.api.clone(),
      f.queue.clone(),
      f.cache.clone(),
      f.clock.clone(),
      SyncConfig::default(),
    );
    let report = sync.drain(est).await.unwrap();

    assert_eq!(report.applied.len(), 2);
    assert_eq!(
      f.api.calls(),
      vec![
        Call::Update(est, EntityId(7), json!({"nome": "Pratos frios"})),
        Call::Update(est, EntityId(7), json!({"nome": "Pratos quentes"})),
      ]
    );
    let listed = f.service.list(est).await.unwrap();
    assert_eq!(listed[0].name, "Pratos quentes");

    // With the backlog cleared, writes go straight to the backend again
    let third = f
      .service
      .update(est, EntityId(7), &CategoryDraft::named("Pratos"))
      .await
      .unwrap();
    assert!(matches!(third, MutationOutcome::Applied(_)));
  }
}

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::operation::OfflineOperation;
use crate::domain::EstablishmentId;
use crate::storage::{KeyValueStorage, StorageError, Write};

const QUEUE_PREFIX: &str = "offline-queue:";

#[derive(Debug, Error)]
pub enum QueueError {
  #[error("failed to persist offline queue: {0}")]
  Storage(#[from] StorageError),

  #[error("offline queue for establishment {establishment} is unreadable: {source}")]
  Corrupt {
    establishment: EstablishmentId,
    #[source]
    source: serde_json::Error,
  },
}

/// Durable FIFO of pending mutations, one list per establishment.
///
/// Every mutation is written through to storage before the call returns,
/// so a failed write is reported to the caller instead of losing the
/// operation. Each change is a single storage transaction, so several
/// processes can share one database without losing each other's writes.
pub struct OfflineQueue {
  storage: Arc<dyn KeyValueStorage>,
}

impl OfflineQueue {
  pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
    Self { storage }
  }

  fn storage_key(establishment: EstablishmentId) -> String {
    format!("{}{}", QUEUE_PREFIX, establishment)
  }

  fn load(&self, establishment: EstablishmentId) -> Result<Vec<OfflineOperation>, QueueError> {
    match self.storage.get(&Self::storage_key(establishment))? {
      None => Ok(Vec::new()),
      Some(json) => serde_json::from_str(&json).map_err(|source| QueueError::Corrupt {
        establishment,
        source,
      }),
    }
  }

  /// Apply `f` to the stored list inside one storage transaction.
  ///
  /// The list is written back only when `f` returns `Some`.
  fn modify<T>(
    &self,
    establishment: EstablishmentId,
    f: impl FnOnce(&mut Vec<OfflineOperation>) -> Option<T>,
  ) -> Result<Option<T>, QueueError> {
    let mut apply = Some(f);
    let mut outcome = None;
    let mut corrupt = None;

    self
      .storage
      .update(&Self::storage_key(establishment), &mut |current| {
        let mut operations: Vec<OfflineOperation> = match current {
          None => Vec::new(),
          Some(json) => match serde_json::from_str(&json) {
            Ok(operations) => operations,
            Err(source) => {
              corrupt = Some(source);
              return Ok(Write::Keep);
            }
          },
        };

        let Some(apply) = apply.take() else {
          return Ok(Write::Keep);
        };
        outcome = apply(&mut operations);
        if outcome.is_none() {
          Ok(Write::Keep)
        } else if operations.is_empty() {
          Ok(Write::Remove)
        } else {
          Ok(Write::Set(serde_json::to_string(&operations)?))
        }
      })?;

    if let Some(source) = corrupt {
      return Err(QueueError::Corrupt {
        establishment,
        source,
      });
    }
    Ok(outcome)
  }

  /// Append an operation to its establishment's queue.
  pub fn enqueue(&self, operation: OfflineOperation) -> Result<(), QueueError> {
    let establishment = operation.establishment_id;
    let id = operation.id;
    let kind = operation.mutation.kind();
    let entity = operation.mutation.entity_id();

    self.modify(establishment, |operations| {
      operations.push(operation);
      Some(())
    })?;

    info!(
      operation = %id,
      %kind,
      entity = ?entity,
      %establishment,
      "queued offline operation"
    );
    Ok(())
  }

  /// Remove an operation. Returns it if it was queued.
  pub fn dequeue(
    &self,
    establishment: EstablishmentId,
    id: Uuid,
  ) -> Result<Option<OfflineOperation>, QueueError> {
    let removed = self.modify(establishment, |operations| {
      let pos = operations.iter().position(|op| op.id == id)?;
      Some(operations.remove(pos))
    })?;

    if removed.is_some() {
      debug!(operation = %id, %establishment, "dequeued offline operation");
    }
    Ok(removed)
  }

  /// Record a failed replay. Returns the new retry count, or `None` when
  /// the operation is no longer queued.
  pub fn increment_retry(
    &self,
    establishment: EstablishmentId,
    id: Uuid,
    error: &str,
    next_attempt_at: Option<DateTime<Utc>>,
  ) -> Result<Option<u32>, QueueError> {
    self.modify(establishment, |operations| {
      let op = operations.iter_mut().find(|op| op.id == id)?;
      op.retry_count += 1;
      op.last_error = Some(error.to_string());
      op.next_attempt_at = next_attempt_at;
      Some(op.retry_count)
    })
  }

  /// Queued operations for an establishment, oldest first.
  pub fn pending(&self, establishment: EstablishmentId) -> Result<Vec<OfflineOperation>, QueueError> {
    self.load(establishment)
  }

  pub fn len(&self, establishment: EstablishmentId) -> Result<usize, QueueError> {
    Ok(self.load(establishment)?.len())
  }

  /// Establishments that currently have queued operations.
  pub fn establishments(&self) -> Result<Vec<EstablishmentId>, QueueError> {
    let mut ids: Vec<EstablishmentId> = self
      .storage
      .keys_with_prefix(QUEUE_PREFIX)?
      .iter()
      .filter_map(|key| key.strip_prefix(QUEUE_PREFIX)?.parse().ok())
      .collect();
    ids.sort();
    Ok(ids)
  }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::domain::{EntityId, EstablishmentId};

/// The change an operation replays. Only creates lack a target entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mutation {
  Create { payload: Value },
  Update { entity_id: EntityId, payload: Value },
  Delete { entity_id: EntityId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
  Create,
  Update,
  Delete,
}

impl fmt::Display for OperationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      OperationKind::Create => "create",
      OperationKind::Update => "update",
      OperationKind::Delete => "delete",
    })
  }
}

impl Mutation {
  pub fn kind(&self) -> OperationKind {
    match self {
      Mutation::Create { .. } => OperationKind::Create,
      Mutation::Update { .. } => OperationKind::Update,
      Mutation::Delete { .. } => OperationKind::Delete,
    }
  }

  pub fn entity_id(&self) -> Option<EntityId> {
    match self {
      Mutation::Create { .. } => None,
      Mutation::Update { entity_id, .. } | Mutation::Delete { entity_id } => Some(*entity_id),
    }
  }
}

/// A mutation recorded while the backend was unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineOperation {
  pub id: Uuid,
  pub establishment_id: EstablishmentId,
  #[serde(flatten)]
  pub mutation: Mutation,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
  /// Earliest time the next replay may run
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub next_attempt_at: Option<DateTime<Utc>>,
}

impl OfflineOperation {
  pub fn new(establishment_id: EstablishmentId, mutation: Mutation, now: DateTime<Utc>) -> Self {
    Self {
      id: Uuid::new_v4(),
      establishment_id,
      mutation,
      enqueued_at: now,
      retry_count: 0,
      last_error: None,
      next_attempt_at: None,
    }
  }

  /// Whether backoff allows a replay at `now`.
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at.map_or(true, |at| at <= now)
  }
}

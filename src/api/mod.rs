//! Remote API capability consumed by the façade and the synchronizer.

pub mod client;
pub mod types;

pub use client::HttpApiClient;
pub use types::{Category, CategoryDraft};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{EntityId, EstablishmentId};

/// Classified failure of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
  #[error("resource not found: {0}")]
  NotFound(String),

  #[error("conflict: {0}")]
  Conflict(String),

  #[error("server error: {0}")]
  Transient(String),

  #[error("request timed out")]
  Timeout,

  #[error("authentication failed: invalid or expired token")]
  Unauthorized,

  #[error("network unreachable: {0}")]
  Offline(String),
}

/// What a replay should do with an operation after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
  /// Keep it queued and try again next cycle
  Retry,
  /// The operation can never apply; drop it
  Discard,
}

impl ApiError {
  pub fn disposition(&self) -> Disposition {
    match self {
      ApiError::NotFound(_) | ApiError::Conflict(_) => Disposition::Discard,
      // Credentials are refreshed out of band before the next drain
      ApiError::Unauthorized => Disposition::Retry,
      ApiError::Transient(_) | ApiError::Timeout | ApiError::Offline(_) => Disposition::Retry,
    }
  }

  /// Whether the failure means the backend could not be reached at all.
  pub fn is_offline(&self) -> bool {
    matches!(self, ApiError::Offline(_))
  }
}

/// Category endpoints of the backend, scoped per establishment.
#[async_trait]
pub trait RemoteApi: Send + Sync {
  async fn list(&self, establishment: EstablishmentId) -> Result<Vec<Category>, ApiError>;

  async fn create(&self, establishment: EstablishmentId, payload: &Value)
    -> Result<Category, ApiError>;

  async fn update(
    &self,
    establishment: EstablishmentId,
    id: EntityId,
    payload: &Value,
  ) -> Result<Category, ApiError>;

  async fn delete(&self, establishment: EstablishmentId, id: EntityId) -> Result<(), ApiError>;
}

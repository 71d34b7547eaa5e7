//! Structured cache keys and invalidation tags.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::domain::{EntityId, EstablishmentId};

/// What a cache entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
  /// Category listing for an establishment
  CategoryList,
  /// A single category
  Category { id: EntityId },
  /// Aggregated category counters
  CategoryStats,
}

/// Cache key scoped to one establishment.
///
/// `params` is the SHA-256 of the normalized query parameters, so two
/// listings with different filters never share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
  pub establishment_id: EstablishmentId,
  pub resource: Resource,
  pub params: Option<String>,
}

impl CacheKey {
  pub fn new(establishment_id: EstablishmentId, resource: Resource) -> Self {
    Self {
      establishment_id,
      resource,
      params: None,
    }
  }

  pub fn category_list(establishment_id: EstablishmentId) -> Self {
    Self::new(establishment_id, Resource::CategoryList)
  }

  pub fn category(establishment_id: EstablishmentId, id: EntityId) -> Self {
    Self::new(establishment_id, Resource::Category { id })
  }

  pub fn category_stats(establishment_id: EstablishmentId) -> Self {
    Self::new(establishment_id, Resource::CategoryStats)
  }

  /// Attach query parameters to the key.
  ///
  /// Parameters are serialized to JSON first; object keys come out sorted,
  /// so field order does not change the digest.
  pub fn with_params<P: Serialize>(mut self, params: &P) -> Result<Self, serde_json::Error> {
    let normalized = serde_json::to_value(params)?.to_string();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    self.params = Some(hex::encode(hasher.finalize()));
    Ok(self)
  }

  /// Tags every entry stored under this key carries.
  pub fn default_tags(&self) -> Vec<Tag> {
    let est = self.establishment_id;
    let mut tags = vec![Tag::establishment(est)];
    match self.resource {
      Resource::CategoryList | Resource::CategoryStats => tags.push(Tag::category_list(est)),
      Resource::Category { id } => tags.push(Tag::category(est, id)),
    }
    tags
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "establishment:{}:", self.establishment_id)?;
    match self.resource {
      Resource::CategoryList => write!(f, "categories")?,
      Resource::Category { id } => write!(f, "category:{}", id)?,
      Resource::CategoryStats => write!(f, "category-stats")?,
    }
    if let Some(params) = &self.params {
      write!(f, ":{}", params)?;
    }
    Ok(())
  }
}

/// Label used for bulk invalidation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
  pub fn new(tag: impl Into<String>) -> Self {
    Self(tag.into())
  }

  /// Everything cached for an establishment.
  pub fn establishment(id: EstablishmentId) -> Self {
    Self(format!("establishment-{}", id))
  }

  /// Listings (and figures derived from listings) for an establishment.
  pub fn category_list(id: EstablishmentId) -> Self {
    Self(format!("category-list-{}", id))
  }

  /// One category of an establishment.
  pub fn category(establishment: EstablishmentId, id: EntityId) -> Self {
    Self(format!("category-{}-{}", establishment, id))
  }
}

impl fmt::Display for Tag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

use serde::{Deserialize, Serialize};

use crate::domain::EntityId;

/// A product category as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
  pub id: EntityId,
  #[serde(rename = "nome")]
  pub name: String,
  #[serde(rename = "descricao", default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(rename = "ativo", default = "default_active")]
  pub active: bool,
}

fn default_active() -> bool {
  true
}

/// Body for creating or updating a category.
///
/// Unset fields are omitted so an update only touches what was given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryDraft {
  #[serde(rename = "nome", default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(rename = "descricao", default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(rename = "ativo", default, skip_serializing_if = "Option::is_none")]
  pub active: Option<bool>,
}

impl CategoryDraft {
  #[cfg(test)]
  pub fn named(name: impl Into<String>) -> Self {
    Self {
      name: Some(name.into()),
      ..Self::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_draft_omits_unset_fields() {
    let draft = CategoryDraft::named("Bebidas");
    assert_eq!(serde_json::to_value(&draft).unwrap(), json!({"nome": "Bebidas"}));
  }

  #[test]
  fn test_category_wire_names() {
    let category: Category =
      serde_json::from_value(json!({"id": 3, "nome": "Sobremesas", "descricao": "Doces"})).unwrap();

    assert_eq!(category.id, EntityId(3));
    assert_eq!(category.name, "Sobremesas");
    assert_eq!(category.description.as_deref(), Some("Doces"));
    assert!(category.active);
  }
}

//! Observed-remove collection model.
//!
//! Each value is identified by an id and carries a set of membership keys.
//! Concurrent adds of the same value use the same id but different keys.
//! A value is removed by removing the keys that were observed; it stays
//! present until its key set is empty.
//!
//! ```text
//!  add("a", k1)     add("a", k2)      remove("a", {k1})   remove("a", {k2})
//!  a:{k1}      ──►  a:{k1,k2}    ──►  a:{k2}         ──►  (gone)
//!  effective        not effective     not effective       effective
//! ```
//!
//! Reference: Shapiro et al. — A comprehensive study of CRDTs (OR-Set)

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::entity::Entity;

/// One serialized entry of a collection model: `{id, value, keys}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub value: Entity,
    #[serde(default)]
    pub keys: Vec<String>,
}

impl ModelEntry {
    pub fn new(value: Entity, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: value.id.clone(),
            value,
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// CRDT model errors.
#[derive(Debug, Clone, PartialEq)]
pub enum CrdtError {
    /// `add` was called without any membership keys
    EmptyKeys { id: String },
    /// The stored value differs but none of the supplied keys are new
    ValueChangeWithoutNewKeys { id: String },
}

impl std::fmt::Display for CrdtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyKeys { id } => write!(f, "add of '{id}' requires at least one key"),
            Self::ValueChangeWithoutNewKeys { id } => {
                write!(f, "cannot change value of '{id}' without new keys")
            }
        }
    }
}

impl std::error::Error for CrdtError {}

#[derive(Debug, Clone)]
struct CrdtItem {
    value: Entity,
    keys: BTreeSet<String>,
}

/// Observed-remove set of entities keyed by id.
///
/// Iteration order is insertion order of ids; an id that is removed and
/// re-added moves to the end.
#[derive(Debug, Clone, Default)]
pub struct CrdtCollectionModel {
    items: HashMap<String, CrdtItem>,
    order: Vec<String>,
}

impl CrdtCollectionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a model from serialized entries.
    pub fn from_literal(entries: impl IntoIterator<Item = ModelEntry>) -> Self {
        let mut model = Self::new();
        for entry in entries {
            if model.items.contains_key(&entry.id) {
                log::warn!("Duplicate id '{}' in model literal; keeping the later entry", entry.id);
            } else {
                model.order.push(entry.id.clone());
            }
            model.items.insert(
                entry.id,
                CrdtItem {
                    value: entry.value,
                    keys: entry.keys.into_iter().collect(),
                },
            );
        }
        model
    }

    /// Add membership `keys` for `value` under `id`.
    ///
    /// Returns whether the change is effective: the id is new to the
    /// collection, or the stored value changed.
    pub fn add(&mut self, id: &str, value: Entity, keys: &[String]) -> Result<bool, CrdtError> {
        if keys.is_empty() {
            return Err(CrdtError::EmptyKeys { id: id.to_string() });
        }

        let Some(item) = self.items.get_mut(id) else {
            self.order.push(id.to_string());
            self.items.insert(
                id.to_string(),
                CrdtItem {
                    value,
                    keys: keys.iter().cloned().collect(),
                },
            );
            return Ok(true);
        };

        let new_keys = keys.iter().any(|k| !item.keys.contains(k));
        let changed = item.value != value;
        if changed && !new_keys {
            return Err(CrdtError::ValueChangeWithoutNewKeys { id: id.to_string() });
        }

        item.keys.extend(keys.iter().cloned());
        if changed {
            item.value = value;
        }
        Ok(changed)
    }

    /// Remove membership `keys` from the value under `id`.
    ///
    /// Returns whether the change is effective: every key is gone and the
    /// value has been dropped from the collection.
    pub fn remove(&mut self, id: &str, keys: &[String]) -> bool {
        let Some(item) = self.items.get_mut(id) else {
            return false;
        };
        for key in keys {
            item.keys.remove(key);
        }
        if !item.keys.is_empty() {
            return false;
        }
        self.items.remove(id);
        self.order.retain(|held| held != id);
        true
    }

    /// Serialize to `[{id, value, keys}]`.
    pub fn to_literal(&self) -> Vec<ModelEntry> {
        self.iter()
            .map(|(id, item)| ModelEntry {
                id: id.to_string(),
                value: item.value.clone(),
                keys: item.keys.iter().cloned().collect(),
            })
            .collect()
    }

    /// All present values, in insertion order.
    pub fn to_list(&self) -> Vec<Entity> {
        self.iter().map(|(_, item)| item.value.clone()).collect()
    }

    pub fn has(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn get_keys(&self, id: &str) -> Vec<String> {
        self.items
            .get(id)
            .map(|item| item.keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_value(&self, id: &str) -> Option<&Entity> {
        self.items.get(id).map(|item| &item.value)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &CrdtItem)> {
        self.order
            .iter()
            .filter_map(|id| self.items.get(id).map(|item| (id.as_str(), item)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(ks: &[&str]) -> Vec<String> {
        ks.iter().map(|k| k.to_string()).collect()
    }

    fn thing(id: &str, value: &str) -> Entity {
        Entity::new(id, json!({ "value": value }))
    }

    #[test]
    fn test_add_new_value_is_effective() {
        let mut model = CrdtCollectionModel::new();
        assert!(model.add("a", thing("a", "x"), &keys(&["k1"])).unwrap());
        assert!(model.has("a"));
        assert_eq!(model.len(), 1);
    }

    #[test]
    fn test_concurrent_add_idempotent() {
        let mut model = CrdtCollectionModel::new();
        assert!(model.add("a", thing("a", "x"), &keys(&["k1"])).unwrap());
        assert!(!model.add("a", thing("a", "x"), &keys(&["k1"])).unwrap());

        assert_eq!(model.len(), 1);
        assert_eq!(model.get_keys("a"), keys(&["k1"]));
    }

    #[test]
    fn test_partial_remove_keeps_value() {
        let mut model = CrdtCollectionModel::new();
        model.add("a", thing("a", "x"), &keys(&["k1", "k2"])).unwrap();

        assert!(!model.remove("a", &keys(&["k1"])));
        assert!(model.has("a"));
        assert_eq!(model.get_keys("a"), keys(&["k2"]));

        assert!(model.remove("a", &keys(&["k2"])));
        assert!(!model.has("a"));
        assert!(model.is_empty());
    }

    #[test]
    fn test_remove_unknown_id() {
        let mut model = CrdtCollectionModel::new();
        assert!(!model.remove("missing", &keys(&["k1"])));
    }

    #[test]
    fn test_add_requires_keys() {
        let mut model = CrdtCollectionModel::new();
        let err = model.add("a", thing("a", "x"), &[]).unwrap_err();
        assert_eq!(err, CrdtError::EmptyKeys { id: "a".into() });
        assert!(model.is_empty());
    }

    #[test]
    fn test_value_change_needs_new_key() {
        let mut model = CrdtCollectionModel::new();
        model.add("a", thing("a", "x"), &keys(&["k1"])).unwrap();

        let err = model.add("a", thing("a", "y"), &keys(&["k1"])).unwrap_err();
        assert!(matches!(err, CrdtError::ValueChangeWithoutNewKeys { .. }));
        assert_eq!(model.get_value("a"), Some(&thing("a", "x")));

        assert!(model.add("a", thing("a", "y"), &keys(&["k2"])).unwrap());
        assert_eq!(model.get_value("a"), Some(&thing("a", "y")));
        assert_eq!(model.get_keys("a"), keys(&["k1", "k2"]));
    }

    #[test]
    fn test_new_key_same_value_not_effective() {
        let mut model = CrdtCollectionModel::new();
        model.add("a", thing("a", "x"), &keys(&["k1"])).unwrap();
        assert!(!model.add("a", thing("a", "x"), &keys(&["k2"])).unwrap());
        assert_eq!(model.get_keys("a"), keys(&["k1", "k2"]));
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut model = CrdtCollectionModel::new();
        model.add("b", thing("b", "1"), &keys(&["k"])).unwrap();
        model.add("a", thing("a", "2"), &keys(&["k"])).unwrap();
        model.add("c", thing("c", "3"), &keys(&["k"])).unwrap();
        model.remove("b", &keys(&["k"]));
        model.add("b", thing("b", "4"), &keys(&["k2"])).unwrap();

        let ids: Vec<String> = model.to_list().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_literal_roundtrip_preserves_keys() {
        let mut model = CrdtCollectionModel::new();
        model.add("a", thing("a", "x"), &keys(&["k1", "k2"])).unwrap();
        model.add("b", thing("b", "y"), &keys(&["k3"])).unwrap();

        let literal = model.to_literal();
        let restored = CrdtCollectionModel::from_literal(literal.clone());
        assert_eq!(restored.to_literal(), literal);
        assert_eq!(restored.get_keys("a"), keys(&["k1", "k2"]));
    }

    #[test]
    fn test_model_entry_serde() {
        let entry = ModelEntry::new(Entity::with_id("a"), ["k"]);
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v, json!({"id": "a", "value": {"id": "a", "rawData": null}, "keys": ["k"]}));
    }
}

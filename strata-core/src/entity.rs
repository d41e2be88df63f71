use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A value held by a store: a stable id plus its serialized fields.
///
/// Equality is deep: two entities are equal when their ids and every
/// field of `raw_data` match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    #[serde(default)]
    pub raw_data: Value,
}

impl Entity {
    pub fn new(id: impl Into<String>, raw_data: Value) -> Self {
        Self {
            id: id.into(),
            raw_data,
        }
    }

    /// Entity with no fields, only an id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self::new(id, Value::Null)
    }

    /// Entity with a freshly generated id.
    pub fn generated(raw_data: Value) -> Self {
        Self::new(format!("!{}", Uuid::new_v4().simple()), raw_data)
    }

    /// Look up a single field of `raw_data`.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.raw_data.get(name)
    }
}

//! Versioned update records and full-model snapshots.
//!
//! Backing stores push events in a loose shape (`RawUpdate`): a version
//! plus one of `add`, `remove` or `data`. They are validated into a typed
//! [`Update`] at the boundary so the proxies only ever see well-formed
//! bodies.

use serde::{Deserialize, Deserializer, Serialize};

use crate::crdt::ModelEntry;
use crate::entity::Entity;
use crate::ids::{Barrier, ParticleId};

/// Per-store version assigned by the backing store.
pub type Version = u64;

/// How far a proxy's local replica can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// No replica requested
    #[default]
    None,
    /// A full-model request is in flight
    Pending,
    /// The local replica is authoritative for reads
    Full,
}

/// One `{value, keys, effective}` item of a collection add/remove.
///
/// `effective` is computed by the backing store against its own model and
/// is only trusted by observers that do not keep a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelItem {
    pub value: Entity,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub effective: bool,
}

impl ModelItem {
    pub fn new(
        value: Entity,
        keys: impl IntoIterator<Item = impl Into<String>>,
        effective: bool,
    ) -> Self {
        Self {
            value,
            keys: keys.into_iter().map(Into::into).collect(),
            effective,
        }
    }
}

/// Body of an update: exactly one of add, remove or data.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateBody {
    Add(Vec<ModelItem>),
    Remove(Vec<ModelItem>),
    /// New singleton value; `None` clears it
    Data(Option<Entity>),
}

/// A validated update event.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub version: Version,
    pub body: UpdateBody,
    pub originator_id: Option<ParticleId>,
    pub barrier: Option<Barrier>,
}

impl Update {
    pub fn add(version: Version, items: Vec<ModelItem>) -> Self {
        Self::new(version, UpdateBody::Add(items))
    }

    pub fn remove(version: Version, items: Vec<ModelItem>) -> Self {
        Self::new(version, UpdateBody::Remove(items))
    }

    pub fn data(version: Version, data: Option<Entity>) -> Self {
        Self::new(version, UpdateBody::Data(data))
    }

    fn new(version: Version, body: UpdateBody) -> Self {
        Self {
            version,
            body,
            originator_id: None,
            barrier: None,
        }
    }

    pub fn with_originator(mut self, originator: impl Into<ParticleId>) -> Self {
        self.originator_id = Some(originator.into());
        self
    }

    pub fn with_barrier(mut self, barrier: Barrier) -> Self {
        self.barrier = Some(barrier);
        self
    }
}

/// Update errors.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateError {
    /// None of `add`, `remove` or `data` was present
    UnknownShape { version: Version },
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownShape { version } => {
                write!(f, "update v{version} has none of add, remove or data")
            }
        }
    }
}

impl std::error::Error for UpdateError {}

/// Update event as pushed by a backing store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUpdate {
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add: Option<Vec<ModelItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove: Option<Vec<ModelItem>>,
    /// `Some(None)` is an explicit `"data": null`
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Option<Entity>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originator_id: Option<ParticleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barrier: Option<Barrier>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl TryFrom<RawUpdate> for Update {
    type Error = UpdateError;

    fn try_from(raw: RawUpdate) -> Result<Self, Self::Error> {
        let body = if let Some(items) = raw.add {
            UpdateBody::Add(items)
        } else if let Some(items) = raw.remove {
            UpdateBody::Remove(items)
        } else if let Some(data) = raw.data {
            UpdateBody::Data(data)
        } else {
            return Err(UpdateError::UnknownShape {
                version: raw.version,
            });
        };
        Ok(Self {
            version: raw.version,
            body,
            originator_id: raw.originator_id,
            barrier: raw.barrier,
        })
    }
}

impl From<Update> for RawUpdate {
    fn from(update: Update) -> Self {
        let mut raw = RawUpdate {
            version: update.version,
            originator_id: update.originator_id,
            barrier: update.barrier,
            ..RawUpdate::default()
        };
        match update.body {
            UpdateBody::Add(items) => raw.add = Some(items),
            UpdateBody::Remove(items) => raw.remove = Some(items),
            UpdateBody::Data(data) => raw.data = Some(data),
        }
        raw
    }
}

/// Full-model response to a synchronize request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: Version,
    pub model: Vec<ModelEntry>,
}

impl Snapshot {
    pub fn new(version: Version, model: Vec<ModelEntry>) -> Self {
        Self { version, model }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_add_validates() {
        let raw: RawUpdate = serde_json::from_value(json!({
            "version": 3,
            "add": [{"value": {"id": "a"}, "keys": ["k"], "effective": true}],
            "originatorId": "p1"
        }))
        .unwrap();
        let update = Update::try_from(raw).unwrap();
        assert_eq!(update.version, 3);
        assert_eq!(update.originator_id, Some(ParticleId::new("p1")));
        match update.body {
            UpdateBody::Add(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].value.id, "a");
                assert!(items[0].effective);
            }
            other => panic!("expected add, got {other:?}"),
        }
    }

    #[test]
    fn test_raw_null_data_is_clear() {
        let raw: RawUpdate =
            serde_json::from_value(json!({"version": 1, "data": null, "barrier": "b"})).unwrap();
        let update = Update::try_from(raw).unwrap();
        assert_eq!(update.body, UpdateBody::Data(None));
        assert_eq!(update.barrier, Some(Barrier::new("b")));
    }

    #[test]
    fn test_raw_unknown_shape_rejected() {
        let raw: RawUpdate = serde_json::from_value(json!({"version": 7})).unwrap();
        assert_eq!(
            Update::try_from(raw).unwrap_err(),
            UpdateError::UnknownShape { version: 7 }
        );
    }

    #[test]
    fn test_raw_from_update_serializes_only_body() {
        let update = Update::data(2, Some(Entity::with_id("x"))).with_originator("p");
        let v = serde_json::to_value(RawUpdate::from(update)).unwrap();
        assert_eq!(
            v,
            json!({"version": 2, "data": {"id": "x", "rawData": null}, "originatorId": "p"})
        );
    }

    #[test]
    fn test_sync_state_default() {
        assert_eq!(SyncState::default(), SyncState::None);
    }
}

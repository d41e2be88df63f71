//! Identifiers used across the proxy boundary.
//!
//! Observers are keyed by `(ParticleId, HandleId)` pairs rather than by
//! object identity, so particles and handles can stay plain values.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identity of a particle; also used as the `originatorId` of its writes.
    ParticleId
);
string_id!(
    /// Identity of a handle within its particle.
    HandleId
);
string_id!(
    /// Identity of a backing store. One proxy exists per store per context.
    StoreId
);
string_id!(
    /// Opaque token attached to a singleton write so its echo can be recognized.
    Barrier
);

impl Barrier {
    /// Mint a fresh token scoped to `store`.
    pub fn mint(store: &StoreId) -> Self {
        Self(format!("{store}:barrier:{}", Uuid::new_v4().simple()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_mint_scoped_and_unique() {
        let store = StoreId::new("store-1");
        let b1 = Barrier::mint(&store);
        let b2 = Barrier::mint(&store);
        assert_ne!(b1, b2);
        assert!(b1.as_str().starts_with("store-1:barrier:"));
    }

    #[test]
    fn test_id_conversions() {
        let p: ParticleId = "p1".into();
        assert_eq!(p.as_str(), "p1");
        assert_eq!(p.to_string(), "p1");
        assert_eq!(ParticleId::from(String::from("p1")), p);
    }

    #[test]
    fn test_id_serde_transparent() {
        let h = HandleId::new("h1");
        assert_eq!(serde_json::to_string(&h).unwrap(), "\"h1\"");
        let back: HandleId = serde_json::from_str("\"h1\"").unwrap();
        assert_eq!(back, h);
    }
}

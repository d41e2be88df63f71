//! # strata-core — Data model for proxied stores
//!
//! Pure data types shared by the synchronization engine and the backing
//! stores it talks to. Nothing in this crate performs I/O.
//!
//! ```text
//! ┌──────────────┐   ModelEntry[]   ┌─────────────────────┐
//! │ Backing store│ ───────────────► │ CrdtCollectionModel │
//! │  (external)  │   RawUpdate      │   id → {value, keys}│
//! └──────────────┘ ───────────────► └─────────────────────┘
//!                   Update (typed)
//! ```
//!
//! ## Modules
//!
//! - [`entity`] — Stored values (`Entity`)
//! - [`ids`] — Particle, handle, store identifiers and barrier tokens
//! - [`crdt`] — Observed-remove collection model
//! - [`update`] — Versioned update records and full-model snapshots

pub mod crdt;
pub mod entity;
pub mod ids;
pub mod update;

pub use crdt::{CrdtCollectionModel, CrdtError, ModelEntry};
pub use entity::Entity;
pub use ids::{Barrier, HandleId, ParticleId, StoreId};
pub use update::{
    ModelItem, RawUpdate, Snapshot, SyncState, Update, UpdateBody, UpdateError, Version,
};

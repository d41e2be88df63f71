//! # strata-proxy — Storage proxy synchronization engine
//!
//! Keeps a local replica of each backing store a particle reads, folds the
//! store's versioned change events into it in order, and fans the results
//! out to the particle handles that registered interest.
//!
//! ## Architecture
//!
//! ```text
//!  particle handles                                  backing store
//!  ┌────────────┐   register / store / set    ┌───────────────────────┐
//!  │ Observer   │ ──────────────────────────► │                       │
//!  │ (P, H)     │       StorageProxy          │  PortMessage  ◄─────  │
//!  └─────▲──────┘   ┌─────────────────────┐   │                       │
//!        │          │ version  queue      │──►│  InitializeProxy      │
//!        │          │ replica  observers  │   │  SynchronizeProxy     │
//!        │          └─────────┬───────────┘   │  Handle*              │
//!        │                    │ notify        │                       │
//!        │          ┌─────────▼───────────┐   │  StoreEvent   ─────►  │
//!        └──────────│   ProxyScheduler    │   │  Update / Synchronize │
//!                   │ (batched per P, H)  │   │  Reply                │
//!                   └─────────────────────┘   └───────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`proxy`] — Collection, singleton, big-collection and no-op proxies
//! - [`scheduler`] — Batched, ordered notification delivery
//! - [`observer`] — Handle options, notifications and the observer registry
//! - [`port`] — Request/response boundary to the backing store
//! - [`context`] — One proxy per store, inbound event routing
//! - [`memory`] — In-memory backing store speaking the port protocol
//! - [`error`] — Proxy errors

pub mod context;
pub mod error;
pub mod memory;
pub mod observer;
pub mod port;
pub mod proxy;
pub mod scheduler;

// Re-exports for convenience
pub use context::{ContextStats, ProxyContext};
pub use error::{DeliveryError, ProxyError};
pub use memory::{MemoryBackingStore, MemoryStoreConfig, MemoryStoreStats};
pub use observer::{
    ChannelObserver, FnObserver, HandleOptions, Notification, Observer, ObserverKey,
    ObserverRegistry, ProxyEvent, Registration, SyncModel, UpdateDetails,
};
pub use port::{
    CorrelationId, CursorId, CursorPage, PendingReply, PortMessage, PortReply, PortRequest,
    ProxyPort, RemoveItem, StoreEvent, SystemException,
};
pub use proxy::{
    BigCollectionProxy, CollectionProxy, Cursor, NoOpProxy, PageStream, ProxyConfig,
    SingletonProxy, StorageProxy, StoreKind, SyncBehavior, SyncCore,
};
pub use scheduler::{ProxyScheduler, SchedulerConfig, SchedulerStats};

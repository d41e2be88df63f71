//! Storage proxies: one local stand-in per store per context.
//!
//! ```text
//!                 ┌──────────────── StorageProxy ────────────────┐
//!                 │ Collection │ Singleton │ BigCollection │ NoOp │
//!                 └─────┬──────┴─────┬─────┴───────┬───────┴──────┘
//!                       │            │             │
//!                       ▼            ▼             ▼
//!                 Proxy<CollectionState> ...  Proxy<BigCollectionState>
//!                       │
//!          ┌────────────┴────────────┐
//!          ▼                         ▼
//!      SyncCore                 SyncBehavior
//!  (version, queue,          (fold snapshots and
//!   observers, port)          updates into replica)
//! ```
//!
//! The no-op variant stands in for proxies of disabled particles and never
//! touches the port.

pub mod big_collection;
pub mod collection;
pub mod noop;
pub mod singleton;
pub mod sync;

pub use big_collection::{BigCollectionProxy, BigCollectionState, Cursor, PageStream};
pub use collection::{CollectionProxy, CollectionState};
pub use noop::NoOpProxy;
pub use singleton::{SingletonProxy, SingletonState};
pub use sync::{SyncBehavior, SyncCore};

use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use strata_core::{RawUpdate, Snapshot, StoreId, SyncState, Update, Version};

use crate::error::ProxyError;
use crate::observer::{ObserverKey, Registration};
use crate::port::ProxyPort;
use crate::scheduler::ProxyScheduler;
use sync::ProxyShared;

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Queue depth above which each new queued update logs a warning.
    /// The queue itself is unbounded; a gap always triggers a resync.
    pub queue_warn_threshold: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            queue_warn_threshold: 64,
        }
    }
}

impl ProxyConfig {
    pub fn for_testing() -> Self {
        Self {
            queue_warn_threshold: 4,
        }
    }
}

/// Kind of store a proxy stands in for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    Collection,
    Singleton,
    BigCollection,
}

impl StoreKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Collection => "collection",
            Self::Singleton => "singleton",
            Self::BigCollection => "big collection",
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle to a proxy of one kind. Clones share the same proxy.
pub struct Proxy<B> {
    store: StoreId,
    port: ProxyPort,
    shared: Arc<Mutex<ProxyShared<B>>>,
}

impl<B> Clone for Proxy<B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            port: self.port.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<B: SyncBehavior> Proxy<B> {
    pub(crate) fn with_behavior(
        store: StoreId,
        name: impl Into<String>,
        behavior: B,
        port: ProxyPort,
        scheduler: ProxyScheduler,
        config: ProxyConfig,
    ) -> Self {
        let core = SyncCore::new(store.clone(), name, port.clone(), scheduler, config);
        Self {
            store,
            port,
            shared: Arc::new(Mutex::new(ProxyShared { core, behavior })),
        }
    }

    pub fn id(&self) -> &StoreId {
        &self.store
    }

    /// Attach an observer. Write-only handles are ignored.
    pub async fn register(&self, registration: Registration) -> Result<(), ProxyError> {
        let mut shared = self.lock().await;
        let ProxyShared { core, behavior } = &mut *shared;
        sync::register(core, behavior, registration)
    }

    /// Detach an observer. The store subscription stays in place.
    pub async fn deregister(&self, key: &ObserverKey) -> bool {
        self.lock().await.core.observers.deregister(key)
    }

    /// Full-model response from the backing store.
    pub async fn on_synchronize(&self, snapshot: Snapshot) -> Result<(), ProxyError> {
        let mut shared = self.lock().await;
        let ProxyShared { core, behavior } = &mut *shared;
        sync::on_synchronize(core, behavior, snapshot)
    }

    /// Change event pushed by the backing store.
    pub async fn on_update(&self, update: Update) -> Result<(), ProxyError> {
        let mut shared = self.lock().await;
        let ProxyShared { core, behavior } = &mut *shared;
        sync::on_update(core, behavior, update)
    }

    pub async fn version(&self) -> Option<Version> {
        self.lock().await.core.version
    }

    pub async fn sync_state(&self) -> SyncState {
        self.lock().await.core.state
    }

    pub async fn observer_count(&self) -> usize {
        self.lock().await.core.observers.len()
    }

    /// Updates waiting for a missing version.
    pub async fn queued_updates(&self) -> usize {
        self.lock().await.core.queue.len()
    }

    /// Full-model requests sent so far, the initial one included.
    pub async fn sync_requests(&self) -> u64 {
        self.lock().await.core.sync_requests
    }

    pub(crate) fn port(&self) -> &ProxyPort {
        &self.port
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, ProxyShared<B>> {
        self.shared.lock().await
    }
}

/// A proxy of any kind.
#[derive(Clone)]
pub enum StorageProxy {
    Collection(CollectionProxy),
    Singleton(SingletonProxy),
    BigCollection(BigCollectionProxy),
    NoOp(NoOpProxy),
}

impl StorageProxy {
    /// Create a live proxy of `kind`.
    pub fn new(
        store: StoreId,
        name: impl Into<String>,
        kind: StoreKind,
        port: ProxyPort,
        scheduler: ProxyScheduler,
        config: ProxyConfig,
    ) -> Self {
        match kind {
            StoreKind::Collection => {
                Self::Collection(CollectionProxy::new(store, name, port, scheduler, config))
            }
            StoreKind::Singleton => {
                Self::Singleton(SingletonProxy::new(store, name, port, scheduler, config))
            }
            StoreKind::BigCollection => Self::BigCollection(BigCollectionProxy::new(
                store, name, port, scheduler, config,
            )),
        }
    }

    /// Inert stand-in for a disabled particle's proxy.
    pub fn no_op(store: StoreId, kind: StoreKind) -> Self {
        Self::NoOp(NoOpProxy::new(store, kind))
    }

    pub fn id(&self) -> &StoreId {
        match self {
            Self::Collection(p) => p.id(),
            Self::Singleton(p) => p.id(),
            Self::BigCollection(p) => p.id(),
            Self::NoOp(p) => p.id(),
        }
    }

    pub fn kind(&self) -> StoreKind {
        match self {
            Self::Collection(_) => StoreKind::Collection,
            Self::Singleton(_) => StoreKind::Singleton,
            Self::BigCollection(_) => StoreKind::BigCollection,
            Self::NoOp(p) => p.kind(),
        }
    }

    pub fn is_no_op(&self) -> bool {
        matches!(self, Self::NoOp(_))
    }

    pub async fn register(&self, registration: Registration) -> Result<(), ProxyError> {
        match self {
            Self::Collection(p) => p.register(registration).await,
            Self::Singleton(p) => p.register(registration).await,
            Self::BigCollection(p) => p.register(registration).await,
            Self::NoOp(_) => Ok(()),
        }
    }

    pub async fn deregister(&self, key: &ObserverKey) -> bool {
        match self {
            Self::Collection(p) => p.deregister(key).await,
            Self::Singleton(p) => p.deregister(key).await,
            Self::BigCollection(p) => p.deregister(key).await,
            Self::NoOp(_) => false,
        }
    }

    /// Validate and fold a pushed change event.
    pub async fn on_update(&self, raw: RawUpdate) -> Result<(), ProxyError> {
        let update = Update::try_from(raw).map_err(|e| ProxyError::invalid_update(self.id(), e))?;
        match self {
            Self::Collection(p) => p.on_update(update).await,
            Self::Singleton(p) => p.on_update(update).await,
            Self::BigCollection(p) => p.on_update(update).await,
            Self::NoOp(_) => Ok(()),
        }
    }

    pub async fn on_synchronize(&self, snapshot: Snapshot) -> Result<(), ProxyError> {
        match self {
            Self::Collection(p) => p.on_synchronize(snapshot).await,
            Self::Singleton(p) => p.on_synchronize(snapshot).await,
            Self::BigCollection(p) => p.on_synchronize(snapshot).await,
            Self::NoOp(_) => Ok(()),
        }
    }

    pub async fn version(&self) -> Option<Version> {
        match self {
            Self::Collection(p) => p.version().await,
            Self::Singleton(p) => p.version().await,
            Self::BigCollection(p) => p.version().await,
            Self::NoOp(_) => None,
        }
    }

    pub async fn sync_state(&self) -> SyncState {
        match self {
            Self::Collection(p) => p.sync_state().await,
            Self::Singleton(p) => p.sync_state().await,
            Self::BigCollection(p) => p.sync_state().await,
            Self::NoOp(_) => SyncState::None,
        }
    }

    pub fn as_collection(&self) -> Option<&CollectionProxy> {
        match self {
            Self::Collection(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_singleton(&self) -> Option<&SingletonProxy> {
        match self {
            Self::Singleton(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_big_collection(&self) -> Option<&BigCollectionProxy> {
        match self {
            Self::BigCollection(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_no_op(&self) -> Option<&NoOpProxy> {
        match self {
            Self::NoOp(p) => Some(p),
            _ => None,
        }
    }
}

impl std::fmt::Debug for StorageProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProxy")
            .field("store", self.id())
            .field("kind", &self.kind())
            .field("no_op", &self.is_no_op())
            .finish()
    }
}

//! Observers (particle handles) and the notifications they receive.
//!
//! Each proxy owns an [`ObserverRegistry`] keyed by `(particle, handle)`.
//! A notification is one of sync, update or desync and is delivered through
//! the [`Observer`] trait by the proxy scheduler.

use std::sync::Arc;
use tokio::sync::mpsc;

use strata_core::{Entity, HandleId, ParticleId, StoreId};

use crate::error::DeliveryError;

/// How a handle wants to observe its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleOptions {
    /// Handles that cannot read are never registered
    pub can_read: bool,
    /// Keep a local replica so reads are served without a round trip
    pub keep_synced: bool,
    pub notify_sync: bool,
    pub notify_update: bool,
    pub notify_desync: bool,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            can_read: true,
            keep_synced: true,
            notify_sync: true,
            notify_update: true,
            notify_desync: false,
        }
    }
}

impl HandleOptions {
    /// Replica-backed handle: sync and update notifications.
    pub fn synced() -> Self {
        Self::default()
    }

    /// Live deltas only, no replica.
    pub fn unsynced() -> Self {
        Self {
            keep_synced: false,
            notify_sync: false,
            ..Self::default()
        }
    }

    /// Handle that only writes.
    pub fn write_only() -> Self {
        Self {
            can_read: false,
            keep_synced: false,
            notify_sync: false,
            notify_update: false,
            notify_desync: false,
        }
    }

    pub fn with_notify_desync(mut self, notify: bool) -> Self {
        self.notify_desync = notify;
        self
    }

    pub fn with_notify_update(mut self, notify: bool) -> Self {
        self.notify_update = notify;
        self
    }

    pub fn with_notify_sync(mut self, notify: bool) -> Self {
        self.notify_sync = notify;
        self
    }
}

/// Stable identity of an observer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObserverKey {
    pub particle: ParticleId,
    pub handle: HandleId,
}

impl ObserverKey {
    pub fn new(particle: impl Into<ParticleId>, handle: impl Into<HandleId>) -> Self {
        Self {
            particle: particle.into(),
            handle: handle.into(),
        }
    }
}

/// Model carried by a sync notification.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncModel {
    Collection(Vec<Entity>),
    Singleton(Option<Entity>),
    /// Big collections sync without data
    Empty,
}

/// Observable delta carried by an update notification.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateDetails {
    Collection {
        add: Vec<Entity>,
        remove: Vec<Entity>,
        originator_id: Option<ParticleId>,
    },
    Singleton {
        data: Option<Entity>,
        originator_id: Option<ParticleId>,
    },
}

impl UpdateDetails {
    pub fn originator_id(&self) -> Option<&ParticleId> {
        match self {
            Self::Collection { originator_id, .. } | Self::Singleton { originator_id, .. } => {
                originator_id.as_ref()
            }
        }
    }
}

/// What happened to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent {
    Sync(SyncModel),
    Update(UpdateDetails),
    Desync,
}

impl ProxyEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::Update(_) => "update",
            Self::Desync => "desync",
        }
    }
}

/// A proxy event addressed to one observer.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub store: StoreId,
    pub particle: ParticleId,
    pub handle: HandleId,
    pub event: ProxyEvent,
}

/// Receiver of proxy notifications, typically a particle's handle.
///
/// Deliveries happen on the scheduler's dispatch pass. An error is reported
/// to the host and does not stop delivery of the remaining events.
pub trait Observer: Send + Sync {
    fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Observer that forwards every notification into a channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Observer for ChannelObserver {
    fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        self.tx
            .send(notification.clone())
            .map_err(|_| DeliveryError::new("observer channel closed"))
    }
}

/// Observer backed by a closure.
pub struct FnObserver<F>(pub F);

impl<F> Observer for FnObserver<F>
where
    F: Fn(&Notification) -> Result<(), DeliveryError> + Send + Sync,
{
    fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        (self.0)(notification)
    }
}

/// One registered observer.
#[derive(Clone)]
pub struct Registration {
    pub key: ObserverKey,
    pub options: HandleOptions,
    pub observer: Arc<dyn Observer>,
}

impl Registration {
    pub fn new(
        particle: impl Into<ParticleId>,
        handle: impl Into<HandleId>,
        options: HandleOptions,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            key: ObserverKey::new(particle, handle),
            options,
            observer,
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Observers of one proxy, in registration order.
#[derive(Debug, Default)]
pub struct ObserverRegistry {
    entries: Vec<Registration>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer. Re-registering a key replaces its options and sink
    /// in place; returns whether the key was new.
    pub fn register(&mut self, registration: Registration) -> bool {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|r| r.key == registration.key)
        {
            *existing = registration;
            return false;
        }
        self.entries.push(registration);
        true
    }

    pub fn deregister(&mut self, key: &ObserverKey) -> bool {
        let before = self.entries.len();
        self.entries.retain(|r| &r.key != key);
        self.entries.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.entries.iter()
    }

    /// Observers whose options satisfy `predicate`.
    pub fn matching<'a>(
        &'a self,
        predicate: impl Fn(&HandleOptions) -> bool + 'a,
    ) -> impl Iterator<Item = &'a Registration> + 'a {
        self.entries.iter().filter(move |r| predicate(&r.options))
    }

    pub fn any(&self, predicate: impl Fn(&HandleOptions) -> bool) -> bool {
        self.entries.iter().any(|r| predicate(&r.options))
    }

    /// Whether any observer belongs to `particle`.
    pub fn has_particle(&self, particle: &ParticleId) -> bool {
        self.entries.iter().any(|r| &r.key.particle == particle)
    }

    pub fn get(&self, key: &ObserverKey) -> Option<&Registration> {
        self.entries.iter().find(|r| &r.key == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(particle: &str, handle: &str, options: HandleOptions) -> Registration {
        let (observer, _rx) = ChannelObserver::new();
        Registration::new(particle, handle, options, observer)
    }

    #[test]
    fn test_register_and_deregister() {
        let mut registry = ObserverRegistry::new();
        assert!(registry.register(registration("p1", "h1", HandleOptions::synced())));
        assert!(registry.register(registration("p1", "h2", HandleOptions::synced())));
        assert_eq!(registry.len(), 2);

        assert!(registry.deregister(&ObserverKey::new("p1", "h1")));
        assert!(!registry.deregister(&ObserverKey::new("p1", "h1")));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&ObserverKey::new("p1", "h2")).is_some());
    }

    #[test]
    fn test_reregister_replaces_in_place() {
        let mut registry = ObserverRegistry::new();
        registry.register(registration("p1", "h1", HandleOptions::synced()));
        registry.register(registration("p2", "h1", HandleOptions::synced()));

        assert!(!registry.register(registration("p1", "h1", HandleOptions::unsynced())));
        assert_eq!(registry.len(), 2);

        let first = registry.iter().next().unwrap();
        assert_eq!(first.key, ObserverKey::new("p1", "h1"));
        assert!(!first.options.keep_synced);
    }

    #[test]
    fn test_matching_filters_by_options() {
        let mut registry = ObserverRegistry::new();
        registry.register(registration("p1", "h1", HandleOptions::synced()));
        registry.register(registration("p2", "h1", HandleOptions::unsynced()));
        registry.register(registration(
            "p3",
            "h1",
            HandleOptions::synced().with_notify_desync(true),
        ));

        let live: Vec<_> = registry
            .matching(|o| !o.keep_synced && o.notify_update)
            .map(|r| r.key.particle.to_string())
            .collect();
        assert_eq!(live, vec!["p2"]);

        assert!(registry.any(|o| o.notify_desync));
        assert!(registry.has_particle(&ParticleId::new("p3")));
        assert!(!registry.has_particle(&ParticleId::new("p9")));
    }

    #[test]
    fn test_channel_observer_forwards() {
        let (observer, mut rx) = ChannelObserver::new();
        let n = Notification {
            store: StoreId::new("s"),
            particle: ParticleId::new("p"),
            handle: HandleId::new("h"),
            event: ProxyEvent::Desync,
        };
        observer.deliver(&n).unwrap();
        assert_eq!(rx.try_recv().unwrap(), n);

        drop(rx);
        assert!(observer.deliver(&n).is_err());
    }

    #[test]
    fn test_default_options() {
        let o = HandleOptions::default();
        assert!(o.can_read && o.keep_synced && o.notify_sync && o.notify_update);
        assert!(!o.notify_desync);
        assert!(!HandleOptions::write_only().can_read);
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(ProxyEvent::Desync.kind(), "desync");
        assert_eq!(ProxyEvent::Sync(SyncModel::Empty).kind(), "sync");
    }
}

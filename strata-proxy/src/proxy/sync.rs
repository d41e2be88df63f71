//! Synchronization protocol shared by every proxy kind.
//!
//! ```text
//!            register(keep_synced)          snapshot v
//!   None ───────────────────────► Pending ─────────────► Full
//!                                    ▲                     │
//!                                    │  version gap        │
//!                                    └─────────────────────┘
//!                                      SynchronizeProxy + desync
//! ```
//!
//! Kinds differ only in how they fold snapshots and updates into their
//! replica; that is the [`SyncBehavior`] seam. Everything else (version
//! tracking, the ordered update queue, gap detection, notification fan-out)
//! lives in the free functions here.

use std::collections::VecDeque;

use strata_core::{Barrier, Snapshot, StoreId, SyncState, Update, Version};

use crate::error::ProxyError;
use crate::observer::{
    HandleOptions, Notification, ObserverRegistry, ProxyEvent, Registration, SyncModel,
    UpdateDetails,
};
use crate::port::{PortRequest, ProxyPort};
use crate::proxy::ProxyConfig;
use crate::scheduler::ProxyScheduler;

/// Per-kind replica logic.
pub trait SyncBehavior: Send {
    /// Replace the replica with `snapshot`. Returning false refuses it and
    /// leaves the sync state untouched.
    fn synchronize_model(&mut self, core: &SyncCore, snapshot: Snapshot)
        -> Result<bool, ProxyError>;

    /// Observable effect of `update` without touching the replica.
    fn preview_update(
        &self,
        core: &SyncCore,
        update: &Update,
    ) -> Result<Option<UpdateDetails>, ProxyError>;

    /// Fold `update` into the replica and return its observable effect.
    fn apply_update(
        &mut self,
        core: &mut SyncCore,
        update: &Update,
    ) -> Result<Option<UpdateDetails>, ProxyError>;

    /// Model carried by a sync notification.
    fn model_for_sync(&self, core: &SyncCore) -> Result<SyncModel, ProxyError>;

    /// Whether an update carrying `barrier` is the echo this replica is
    /// waiting for, whatever its version.
    fn awaits_barrier(&self, _barrier: &Barrier) -> bool {
        false
    }

    /// Kinds that never hold a replica return false and skip the protocol.
    fn synchronizes(&self) -> bool {
        true
    }
}

/// State every proxy kind carries.
pub struct SyncCore {
    pub(crate) store: StoreId,
    pub(crate) name: String,
    /// `None` until the first snapshot or barrier echo
    pub(crate) version: Option<Version>,
    pub(crate) state: SyncState,
    /// Not-yet-applicable updates, sorted by version
    pub(crate) queue: VecDeque<Update>,
    pub(crate) observers: ObserverRegistry,
    pub(crate) listener_attached: bool,
    pub(crate) keep_synced: bool,
    pub(crate) sync_requests: u64,
    pub(crate) port: ProxyPort,
    pub(crate) scheduler: ProxyScheduler,
    pub(crate) config: ProxyConfig,
}

impl SyncCore {
    pub(crate) fn new(
        store: StoreId,
        name: impl Into<String>,
        port: ProxyPort,
        scheduler: ProxyScheduler,
        config: ProxyConfig,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            version: None,
            state: SyncState::None,
            queue: VecDeque::new(),
            observers: ObserverRegistry::new(),
            listener_attached: false,
            keep_synced: false,
            sync_requests: 0,
            port,
            scheduler,
            config,
        }
    }

    pub fn store(&self) -> &StoreId {
        &self.store
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_full(&self) -> bool {
        self.state == SyncState::Full
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    /// Enqueue `event` for every observer whose options match.
    pub(crate) fn notify(&self, event: ProxyEvent, predicate: impl Fn(&HandleOptions) -> bool) {
        for registration in self.observers.matching(predicate) {
            self.notify_one(registration, event.clone());
        }
    }

    pub(crate) fn notify_one(&self, registration: &Registration, event: ProxyEvent) {
        self.scheduler.enqueue(
            &registration.observer,
            &self.port,
            Notification {
                store: self.store.clone(),
                particle: registration.key.particle.clone(),
                handle: registration.key.handle.clone(),
                event,
            },
        );
    }

    /// Ask the backing store for a full model.
    pub(crate) fn request_sync(&mut self) -> Result<(), ProxyError> {
        self.port.send(&self.store, PortRequest::SynchronizeProxy)?;
        self.sync_requests += 1;
        self.state = SyncState::Pending;
        Ok(())
    }
}

/// Shared state behind a proxy handle's lock.
pub(crate) struct ProxyShared<B> {
    pub(crate) core: SyncCore,
    pub(crate) behavior: B,
}

pub(crate) fn register<B: SyncBehavior>(
    core: &mut SyncCore,
    behavior: &B,
    registration: Registration,
) -> Result<(), ProxyError> {
    if !registration.options.can_read {
        log::debug!(
            "Skipping write-only handle {}/{} on '{}'",
            registration.key.particle,
            registration.key.handle,
            core.name
        );
        return Ok(());
    }

    if !behavior.synchronizes() {
        core.notify_one(&registration, ProxyEvent::Sync(SyncModel::Empty));
        core.observers.register(registration);
        return Ok(());
    }

    let options = registration.options;
    core.observers.register(registration.clone());

    if !core.listener_attached {
        core.port.send(&core.store, PortRequest::InitializeProxy)?;
        core.listener_attached = true;
    }

    if options.keep_synced {
        if !core.keep_synced {
            core.keep_synced = true;
            core.request_sync()?;
        }
        // Late joiners get the replica immediately.
        if options.notify_sync && core.is_full() {
            let model = behavior.model_for_sync(core)?;
            core.notify_one(&registration, ProxyEvent::Sync(model));
        }
    }
    Ok(())
}

pub(crate) fn on_synchronize<B: SyncBehavior>(
    core: &mut SyncCore,
    behavior: &mut B,
    snapshot: Snapshot,
) -> Result<(), ProxyError> {
    if let Some(current) = core.version {
        if snapshot.version <= current {
            log::warn!(
                "StorageProxy '{}' received stale model version {}; current is {}",
                core.name,
                snapshot.version,
                current
            );
            return Ok(());
        }
    }

    let version = snapshot.version;
    if !behavior.synchronize_model(core, snapshot)? {
        log::debug!("StorageProxy '{}' deferred model v{version}", core.name);
        return Ok(());
    }

    core.version = Some(version);
    core.state = SyncState::Full;
    core.queue.retain(|update| update.version > version);
    log::debug!(
        "StorageProxy '{}' synchronized at v{version}, {} updates to replay",
        core.name,
        core.queue.len()
    );

    let model = behavior.model_for_sync(core)?;
    core.notify(ProxyEvent::Sync(model), |o| o.keep_synced && o.notify_sync);
    process_updates(core, behavior)
}

pub(crate) fn on_update<B: SyncBehavior>(
    core: &mut SyncCore,
    behavior: &mut B,
    update: Update,
) -> Result<(), ProxyError> {
    if !behavior.synchronizes() {
        return Err(ProxyError::unsupported(&core.store, "on_update"));
    }

    // Observers without a replica never wait for ordering.
    if core.observers.any(|o| !o.keep_synced && o.notify_update) {
        if let Some(details) = behavior.preview_update(core, &update)? {
            core.notify(ProxyEvent::Update(details), |o| {
                !o.keep_synced && o.notify_update
            });
        }
    }

    if !core.keep_synced {
        return Ok(());
    }
    if let Some(current) = core.version {
        if update.version <= current {
            log::warn!(
                "StorageProxy '{}' received stale update version {}; current is {}",
                core.name,
                update.version,
                current
            );
            return Ok(());
        }
    }

    match core
        .queue
        .binary_search_by_key(&update.version, |queued| queued.version)
    {
        Ok(_) => {
            log::warn!(
                "StorageProxy '{}' received duplicate update version {}",
                core.name,
                update.version
            );
            return Ok(());
        }
        Err(position) => core.queue.insert(position, update),
    }
    if core.queue.len() > core.config.queue_warn_threshold {
        log::warn!(
            "StorageProxy '{}' has {} queued updates",
            core.name,
            core.queue.len()
        );
    }

    process_updates(core, behavior)
}

fn process_updates<B: SyncBehavior>(
    core: &mut SyncCore,
    behavior: &mut B,
) -> Result<(), ProxyError> {
    while let Some(head) = core.queue.front() {
        let next = core.version.is_some_and(|v| head.version == v + 1)
            || head
                .barrier
                .as_ref()
                .is_some_and(|b| behavior.awaits_barrier(b));
        if !next {
            break;
        }
        let Some(update) = core.queue.pop_front() else {
            break;
        };

        let details = match behavior.apply_update(core, &update) {
            Ok(details) => details,
            Err(e) => {
                // The replica may be half-applied; only a fresh model fixes it.
                if core.state != SyncState::Pending {
                    log::error!(
                        "StorageProxy '{}' failed to apply v{}: {e}",
                        core.name,
                        update.version
                    );
                    core.request_sync()?;
                    core.notify(ProxyEvent::Desync, |o| o.notify_desync);
                }
                return Err(e);
            }
        };
        core.version = Some(update.version);
        if let Some(details) = details {
            core.notify(ProxyEvent::Update(details), |o| o.keep_synced && o.notify_update);
        }
    }

    if !core.queue.is_empty() {
        if core.is_full() {
            log::info!(
                "StorageProxy '{}' desynchronized at v{:?} with {} updates queued",
                core.name,
                core.version,
                core.queue.len()
            );
            core.request_sync()?;
            core.notify(ProxyEvent::Desync, |o| o.notify_desync);
        }
    } else if core.state != SyncState::Full {
        // Caught up without the pending snapshot.
        core.state = SyncState::Full;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::ChannelObserver;
    use crate::port::PortMessage;
    use crate::scheduler::SchedulerConfig;
    use strata_core::{Entity, UpdateBody};
    use tokio::sync::mpsc;

    /// Replica that records the latest data body it saw.
    #[derive(Default)]
    struct Recorder {
        last: Option<Entity>,
        applied: Vec<Version>,
        reject: Option<Version>,
    }

    impl SyncBehavior for Recorder {
        fn synchronize_model(&mut self, _: &SyncCore, snapshot: Snapshot) -> Result<bool, ProxyError> {
            self.last = snapshot.model.into_iter().next().map(|e| e.value);
            Ok(true)
        }

        fn preview_update(&self, _: &SyncCore, update: &Update) -> Result<Option<UpdateDetails>, ProxyError> {
            Ok(details(update))
        }

        fn apply_update(&mut self, core: &mut SyncCore, update: &Update) -> Result<Option<UpdateDetails>, ProxyError> {
            if self.reject == Some(update.version) {
                return Err(ProxyError::unsupported(&core.store, "apply_update"));
            }
            self.applied.push(update.version);
            if let UpdateBody::Data(data) = &update.body {
                self.last = data.clone();
            }
            Ok(details(update))
        }

        fn model_for_sync(&self, _: &SyncCore) -> Result<SyncModel, ProxyError> {
            Ok(SyncModel::Singleton(self.last.clone()))
        }
    }

    fn details(update: &Update) -> Option<UpdateDetails> {
        match &update.body {
            UpdateBody::Data(data) => Some(UpdateDetails::Singleton {
                data: data.clone(),
                originator_id: update.originator_id.clone(),
            }),
            _ => None,
        }
    }

    fn fixture() -> (SyncCore, mpsc::UnboundedReceiver<PortMessage>) {
        let (port, rx) = ProxyPort::channel();
        let scheduler = ProxyScheduler::new(SchedulerConfig::for_testing());
        (
            SyncCore::new(StoreId::new("s"), "s", port, scheduler, ProxyConfig::for_testing()),
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PortMessage>) -> Vec<PortRequest> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg.request);
        }
        out
    }

    fn data(version: Version, id: &str) -> Update {
        Update::data(version, Some(Entity::with_id(id)))
    }

    #[test]
    fn test_register_subscribes_once() {
        let (mut core, mut rx) = fixture();
        let recorder = Recorder::default();
        let (observer, _notes) = ChannelObserver::new();

        register(&mut core, &recorder, Registration::new("p1", "h1", HandleOptions::synced(), observer.clone())).unwrap();
        register(&mut core, &recorder, Registration::new("p2", "h1", HandleOptions::synced(), observer)).unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![PortRequest::InitializeProxy, PortRequest::SynchronizeProxy]
        );
        assert_eq!(core.state, SyncState::Pending);
        assert_eq!(core.observers.len(), 2);
    }

    #[test]
    fn test_write_only_handle_not_registered() {
        let (mut core, mut rx) = fixture();
        let (observer, _notes) = ChannelObserver::new();
        register(&mut core, &Recorder::default(), Registration::new("p", "h", HandleOptions::write_only(), observer)).unwrap();

        assert!(core.observers.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_updates_wait_for_first_snapshot() {
        let (mut core, _rx) = fixture();
        let mut recorder = Recorder::default();
        let (observer, _notes) = ChannelObserver::new();
        register(&mut core, &recorder, Registration::new("p", "h", HandleOptions::synced(), observer)).unwrap();

        on_update(&mut core, &mut recorder, data(3, "c")).unwrap();
        on_update(&mut core, &mut recorder, data(2, "b")).unwrap();
        assert_eq!(core.queue.len(), 2);
        assert!(recorder.applied.is_empty());

        on_synchronize(&mut core, &mut recorder, Snapshot::new(1, vec![])).unwrap();
        assert_eq!(recorder.applied, vec![2, 3]);
        assert_eq!(core.version, Some(3));
        assert_eq!(core.state, SyncState::Full);
        assert_eq!(recorder.last, Some(Entity::with_id("c")));
    }

    #[test]
    fn test_stale_update_and_snapshot_dropped() {
        let (mut core, _rx) = fixture();
        let mut recorder = Recorder::default();
        let (observer, _notes) = ChannelObserver::new();
        register(&mut core, &recorder, Registration::new("p", "h", HandleOptions::synced(), observer)).unwrap();
        on_synchronize(&mut core, &mut recorder, Snapshot::new(4, vec![])).unwrap();

        on_update(&mut core, &mut recorder, data(4, "old")).unwrap();
        on_synchronize(&mut core, &mut recorder, Snapshot::new(4, vec![])).unwrap();

        assert!(recorder.applied.is_empty());
        assert!(core.queue.is_empty());
        assert_eq!(core.version, Some(4));
        assert_eq!(core.sync_requests, 1);
    }

    #[test]
    fn test_snapshot_discards_redundant_queue() {
        let (mut core, _rx) = fixture();
        let mut recorder = Recorder::default();
        let (observer, _notes) = ChannelObserver::new();
        register(&mut core, &recorder, Registration::new("p", "h", HandleOptions::synced(), observer)).unwrap();

        on_update(&mut core, &mut recorder, data(2, "b")).unwrap();
        on_update(&mut core, &mut recorder, data(5, "e")).unwrap();
        on_update(&mut core, &mut recorder, data(6, "f")).unwrap();
        on_synchronize(&mut core, &mut recorder, Snapshot::new(5, vec![])).unwrap();

        assert_eq!(recorder.applied, vec![6]);
        assert_eq!(core.version, Some(6));
    }

    #[test]
    fn test_gap_requests_single_resync() {
        let (mut core, mut rx) = fixture();
        let mut recorder = Recorder::default();
        let (observer, _notes) = ChannelObserver::new();
        register(
            &mut core,
            &recorder,
            Registration::new("p", "h", HandleOptions::synced().with_notify_desync(true), observer),
        )
        .unwrap();
        on_synchronize(&mut core, &mut recorder, Snapshot::new(0, vec![])).unwrap();
        drain(&mut rx);

        on_update(&mut core, &mut recorder, data(1, "a")).unwrap();
        on_update(&mut core, &mut recorder, data(2, "b")).unwrap();
        on_update(&mut core, &mut recorder, data(4, "d")).unwrap();
        on_update(&mut core, &mut recorder, data(5, "e")).unwrap();

        assert_eq!(drain(&mut rx), vec![PortRequest::SynchronizeProxy]);
        assert_eq!(core.state, SyncState::Pending);
        assert_eq!(core.version, Some(2));

        // The missing update closes the gap before the snapshot lands.
        on_update(&mut core, &mut recorder, data(3, "c")).unwrap();
        assert_eq!(core.state, SyncState::Full);
        assert_eq!(core.version, Some(5));
        assert_eq!(recorder.applied, vec![1, 2, 3, 4, 5]);

        // The late snapshot is now stale.
        on_synchronize(&mut core, &mut recorder, Snapshot::new(4, vec![])).unwrap();
        assert_eq!(recorder.last, Some(Entity::with_id("e")));
    }

    #[test]
    fn test_duplicate_queued_version_ignored() {
        let (mut core, _rx) = fixture();
        let mut recorder = Recorder::default();
        let (observer, _notes) = ChannelObserver::new();
        register(&mut core, &recorder, Registration::new("p", "h", HandleOptions::synced(), observer)).unwrap();

        on_update(&mut core, &mut recorder, data(3, "c")).unwrap();
        on_update(&mut core, &mut recorder, data(3, "c")).unwrap();
        assert_eq!(core.queue.len(), 1);
    }

    #[test]
    fn test_unsynced_observer_only_gets_preview() {
        let (mut core, mut rx) = fixture();
        let mut recorder = Recorder::default();
        let (observer, _notes) = ChannelObserver::new();
        register(&mut core, &recorder, Registration::new("p", "h", HandleOptions::unsynced(), observer)).unwrap();
        assert_eq!(drain(&mut rx), vec![PortRequest::InitializeProxy]);

        on_update(&mut core, &mut recorder, data(9, "z")).unwrap();
        assert!(core.queue.is_empty());
        assert!(recorder.applied.is_empty());
        assert_eq!(core.scheduler.pending_events(), 1);
    }

    #[test]
    fn test_failed_apply_forces_resync() {
        let (mut core, mut rx) = fixture();
        let mut recorder = Recorder {
            reject: Some(2),
            ..Recorder::default()
        };
        let (observer, mut notes) = ChannelObserver::new();
        register(
            &mut core,
            &recorder,
            Registration::new("p", "h", HandleOptions::synced().with_notify_desync(true), observer),
        )
        .unwrap();
        on_synchronize(&mut core, &mut recorder, Snapshot::new(0, vec![])).unwrap();
        drain(&mut rx);

        on_update(&mut core, &mut recorder, data(1, "a")).unwrap();
        assert!(on_update(&mut core, &mut recorder, data(2, "b")).is_err());

        assert_eq!(core.version, Some(1));
        assert_eq!(core.state, SyncState::Pending);
        assert_eq!(drain(&mut rx), vec![PortRequest::SynchronizeProxy]);

        core.scheduler.dispatch();
        let kinds: Vec<_> = std::iter::from_fn(|| notes.try_recv().ok())
            .map(|n| n.event.kind())
            .collect();
        assert_eq!(kinds, vec!["sync", "update", "desync"]);

        // The fresh model brings the replica back.
        on_synchronize(&mut core, &mut recorder, Snapshot::new(2, vec![])).unwrap();
        assert_eq!(core.state, SyncState::Full);
        assert_eq!(core.version, Some(2));
    }
}

//! In-memory backing store.
//!
//! ```text
//!  PortMessage ──► MemoryBackingStore ──► StoreEvent::{Update, Synchronize, Reply}
//!                        │
//!                        ├─ collection      CrdtCollectionModel
//!                        ├─ singleton       Option<Entity>
//!                        └─ big collection  BTreeMap<id, Entity> + open cursors
//! ```
//!
//! Speaks the same protocol a remote store would. Every accepted write
//! bumps the store version; once a proxy has sent `InitializeProxy` the
//! write is pushed back as a change event tagged with the writer's
//! particle id. Used by the shell and by the integration tests.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use strata_core::{
    Barrier, CrdtCollectionModel, Entity, ModelEntry, ModelItem, ParticleId, RawUpdate, Snapshot,
    StoreId, Update, Version,
};

use crate::port::{
    CorrelationId, CursorId, CursorPage, PortMessage, PortReply, PortRequest, RemoveItem,
    StoreEvent, SystemException,
};
use crate::proxy::StoreKind;

/// Memory store configuration.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Version a freshly created store starts at
    pub initial_version: Version,
    /// Upper bound on the page size a cursor may ask for
    pub cursor_page_limit: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            initial_version: 0,
            cursor_page_limit: 256,
        }
    }
}

impl MemoryStoreConfig {
    pub fn for_testing() -> Self {
        Self {
            initial_version: 0,
            cursor_page_limit: 4,
        }
    }
}

/// Request counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStoreStats {
    pub messages_handled: u64,
    pub updates_pushed: u64,
    pub snapshots_served: u64,
    /// Messages addressed to stores that were never created
    pub unknown_store: u64,
}

enum StoreData {
    Collection(CrdtCollectionModel),
    Singleton(Option<Entity>),
    BigCollection(BTreeMap<String, Entity>),
}

impl StoreData {
    fn empty(kind: StoreKind) -> Self {
        match kind {
            StoreKind::Collection => Self::Collection(CrdtCollectionModel::new()),
            StoreKind::Singleton => Self::Singleton(None),
            StoreKind::BigCollection => Self::BigCollection(BTreeMap::new()),
        }
    }

    fn kind(&self) -> StoreKind {
        match self {
            Self::Collection(_) => StoreKind::Collection,
            Self::Singleton(_) => StoreKind::Singleton,
            Self::BigCollection(_) => StoreKind::BigCollection,
        }
    }
}

struct MemoryStore {
    version: Version,
    data: StoreData,
    /// A proxy asked for change events
    subscribed: bool,
}

/// Open cursor: a copy of the store taken when it was opened.
struct OpenCursor {
    store: StoreId,
    opened_at: Version,
    page_size: usize,
    remaining: VecDeque<Entity>,
}

struct MemoryState {
    config: MemoryStoreConfig,
    stores: HashMap<StoreId, MemoryStore>,
    cursors: HashMap<CursorId, OpenCursor>,
    next_cursor: CursorId,
    exceptions: Vec<SystemException>,
    stats: MemoryStoreStats,
    events: mpsc::UnboundedSender<StoreEvent>,
}

/// Backing store kept entirely in memory. Clones share the same stores.
#[derive(Clone)]
pub struct MemoryBackingStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackingStore {
    /// Create a store together with the receiver a proxy context drains.
    pub fn new(config: MemoryStoreConfig) -> (Self, mpsc::UnboundedReceiver<StoreEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let state = MemoryState {
            config,
            stores: HashMap::new(),
            cursors: HashMap::new(),
            next_cursor: 1,
            exceptions: Vec::new(),
            stats: MemoryStoreStats::default(),
            events,
        };
        (
            Self {
                state: Arc::new(Mutex::new(state)),
            },
            rx,
        )
    }

    /// Create an empty store. Returns false if `store` already exists.
    pub fn create(&self, store: impl Into<StoreId>, kind: StoreKind) -> bool {
        let store = store.into();
        let mut state = self.lock();
        if state.stores.contains_key(&store) {
            return false;
        }
        let version = state.config.initial_version;
        log::debug!("Created {kind} store {store} at v{version}");
        state.stores.insert(
            store,
            MemoryStore {
                version,
                data: StoreData::empty(kind),
                subscribed: false,
            },
        );
        true
    }

    /// Serve one request from a proxy port.
    pub fn handle(&self, message: PortMessage) {
        let PortMessage {
            store,
            correlation_id,
            request,
        } = message;
        let mut state = self.lock();
        state.stats.messages_handled += 1;

        if let PortRequest::ReportException(exception) = request {
            log::warn!(
                "Proxy for {store} reported {}: {}",
                exception.method,
                exception.message
            );
            state.exceptions.push(exception);
            state.reply(correlation_id, PortReply::Ack);
            return;
        }

        let reply = if state.stores.contains_key(&store) {
            state.serve(&store, request)
        } else {
            log::warn!("Request for unknown store {store}");
            state.stats.unknown_store += 1;
            empty_reply(&request)
        };
        if let Some(reply) = reply {
            state.reply(correlation_id, reply);
        }
    }

    /// Serve requests until every port feeding `requests` is dropped.
    pub fn spawn(&self, mut requests: mpsc::UnboundedReceiver<PortMessage>) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            while let Some(message) = requests.recv().await {
                store.handle(message);
            }
            log::info!("Memory backing store stopped: request channel closed");
        })
    }

    /// Write to a collection directly, as a writer outside this context would.
    pub fn store_value(
        &self,
        store: &StoreId,
        value: Entity,
        keys: Vec<String>,
        originator: impl Into<ParticleId>,
    ) {
        self.lock()
            .store_value(store, value, keys, Some(originator.into()));
    }

    /// Remove from a collection directly. Empty `keys` removes every key held.
    pub fn remove_value(
        &self,
        store: &StoreId,
        id: &str,
        keys: Vec<String>,
        originator: impl Into<ParticleId>,
    ) {
        let item = RemoveItem {
            id: id.to_string(),
            keys,
        };
        self.lock()
            .remove_values(store, vec![item], Some(originator.into()));
    }

    /// Set a singleton directly. `None` clears it.
    pub fn set_value(
        &self,
        store: &StoreId,
        data: Option<Entity>,
        originator: impl Into<ParticleId>,
    ) {
        self.lock()
            .set_value(store, data, Some(originator.into()), None);
    }

    /// Jump a store's version without emitting anything, so the next write
    /// arrives at subscribers with a gap.
    pub fn set_version(&self, store: &StoreId, version: Version) -> bool {
        match self.lock().stores.get_mut(store) {
            Some(held) => {
                held.version = version;
                true
            }
            None => false,
        }
    }

    /// Push an arbitrary change event to subscribers.
    pub fn push_raw(&self, store: &StoreId, update: RawUpdate) {
        let mut state = self.lock();
        state.stats.updates_pushed += 1;
        state.send(StoreEvent::Update {
            store: store.clone(),
            update,
        });
    }

    pub fn version(&self, store: &StoreId) -> Option<Version> {
        self.lock().stores.get(store).map(|held| held.version)
    }

    pub fn snapshot(&self, store: &StoreId) -> Option<Snapshot> {
        self.lock().stores.get(store).map(snapshot_of)
    }

    pub fn open_cursors(&self) -> usize {
        self.lock().cursors.len()
    }

    /// Exceptions proxies have reported so far.
    pub fn exceptions(&self) -> Vec<SystemException> {
        self.lock().exceptions.clone()
    }

    pub fn stats(&self) -> MemoryStoreStats {
        self.lock().stats.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryState {
    /// Apply one request to a known store. Returns the reply to correlate.
    fn serve(&mut self, store: &StoreId, request: PortRequest) -> Option<PortReply> {
        match request {
            PortRequest::InitializeProxy => {
                if let Some(held) = self.stores.get_mut(store) {
                    held.subscribed = true;
                }
                Some(PortReply::Ack)
            }
            PortRequest::SynchronizeProxy => {
                let snapshot = self.stores.get(store).map(snapshot_of)?;
                self.stats.snapshots_served += 1;
                self.send(StoreEvent::Synchronize {
                    store: store.clone(),
                    snapshot,
                });
                None
            }
            PortRequest::HandleGet => {
                let data = match &self.stores.get(store)?.data {
                    StoreData::Singleton(data) => data.clone(),
                    _ => None,
                };
                Some(PortReply::Entity(data))
            }
            PortRequest::HandleToList => {
                let list = match &self.stores.get(store)?.data {
                    StoreData::Collection(model) => model.to_list(),
                    StoreData::Singleton(data) => data.iter().cloned().collect(),
                    StoreData::BigCollection(items) => items.values().cloned().collect(),
                };
                Some(PortReply::List(list))
            }
            PortRequest::HandleSet {
                data,
                particle_id,
                barrier,
            } => {
                self.set_value(store, Some(data), Some(particle_id), barrier);
                Some(PortReply::Ack)
            }
            PortRequest::HandleClear {
                particle_id,
                barrier,
            } => {
                self.set_value(store, None, Some(particle_id), barrier);
                Some(PortReply::Ack)
            }
            PortRequest::HandleStore {
                value,
                keys,
                particle_id,
            } => {
                self.store_value(store, value, keys, Some(particle_id));
                Some(PortReply::Ack)
            }
            PortRequest::HandleRemove {
                id,
                keys,
                particle_id,
            } => {
                self.remove_values(store, vec![RemoveItem { id, keys }], Some(particle_id));
                Some(PortReply::Ack)
            }
            PortRequest::HandleRemoveMultiple { items, particle_id } => {
                let items = if items.is_empty() {
                    self.all_items(store)
                } else {
                    items
                };
                self.remove_values(store, items, Some(particle_id));
                Some(PortReply::Ack)
            }
            PortRequest::HandleStream { page_size, forward } => {
                Some(PortReply::Cursor(self.open_cursor(store, page_size, forward)))
            }
            PortRequest::StreamCursorNext { cursor_id } => {
                Some(PortReply::Page(self.next_page(cursor_id)))
            }
            PortRequest::StreamCursorClose { cursor_id } => {
                if self.cursors.remove(&cursor_id).is_some() {
                    log::debug!("Closed cursor {cursor_id} on {store}");
                }
                Some(PortReply::Ack)
            }
            PortRequest::ReportException(_) => Some(PortReply::Ack),
        }
    }

    fn store_value(
        &mut self,
        store: &StoreId,
        value: Entity,
        keys: Vec<String>,
        originator: Option<ParticleId>,
    ) {
        let Some(held) = self.stores.get_mut(store) else {
            return;
        };
        let update = match &mut held.data {
            StoreData::Collection(model) => {
                let effective = match model.add(&value.id, value.clone(), &keys) {
                    Ok(effective) => effective,
                    Err(e) => {
                        log::warn!("Rejected store into {store}: {e}");
                        return;
                    }
                };
                held.version += 1;
                Update::add(held.version, vec![ModelItem::new(value, keys, effective)])
            }
            StoreData::BigCollection(items) => {
                items.insert(value.id.clone(), value);
                held.version += 1;
                return;
            }
            StoreData::Singleton(_) => {
                log::warn!("Store request against singleton {store}");
                return;
            }
        };
        let subscribed = held.subscribed;
        self.push(store, subscribed, update, originator);
    }

    fn remove_values(
        &mut self,
        store: &StoreId,
        items: Vec<RemoveItem>,
        originator: Option<ParticleId>,
    ) {
        let Some(held) = self.stores.get_mut(store) else {
            return;
        };
        let update = match &mut held.data {
            StoreData::Collection(model) => {
                let mut removed = Vec::new();
                for item in items {
                    let Some(value) = model.get_value(&item.id).cloned() else {
                        continue;
                    };
                    let keys = if item.keys.is_empty() {
                        model.get_keys(&item.id)
                    } else {
                        item.keys
                    };
                    let effective = model.remove(&item.id, &keys);
                    removed.push(ModelItem::new(value, keys, effective));
                }
                if removed.is_empty() {
                    return;
                }
                held.version += 1;
                Update::remove(held.version, removed)
            }
            StoreData::BigCollection(held_items) => {
                let before = held_items.len();
                for item in items {
                    held_items.remove(&item.id);
                }
                if held_items.len() != before {
                    held.version += 1;
                }
                return;
            }
            StoreData::Singleton(_) => {
                log::warn!("Remove request against singleton {store}");
                return;
            }
        };
        let subscribed = held.subscribed;
        self.push(store, subscribed, update, originator);
    }

    fn set_value(
        &mut self,
        store: &StoreId,
        data: Option<Entity>,
        originator: Option<ParticleId>,
        barrier: Option<Barrier>,
    ) {
        let Some(held) = self.stores.get_mut(store) else {
            return;
        };
        let StoreData::Singleton(current) = &mut held.data else {
            log::warn!("Set request against {} store {store}", held.data.kind());
            return;
        };
        // A barrier always gets its echo, even for an unchanged value.
        if *current == data && barrier.is_none() {
            return;
        }
        *current = data.clone();
        held.version += 1;
        let mut update = Update::data(held.version, data);
        if let Some(barrier) = barrier {
            update = update.with_barrier(barrier);
        }
        let subscribed = held.subscribed;
        self.push(store, subscribed, update, originator);
    }

    fn all_items(&self, store: &StoreId) -> Vec<RemoveItem> {
        match self.stores.get(store).map(|held| &held.data) {
            Some(StoreData::Collection(model)) => model
                .to_list()
                .into_iter()
                .map(|entity| RemoveItem {
                    keys: model.get_keys(&entity.id),
                    id: entity.id,
                })
                .collect(),
            Some(StoreData::BigCollection(items)) => items
                .keys()
                .map(|id| RemoveItem {
                    id: id.clone(),
                    keys: Vec::new(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn open_cursor(&mut self, store: &StoreId, page_size: usize, forward: bool) -> CursorId {
        let Some(held) = self.stores.get(store) else {
            return 0;
        };
        let StoreData::BigCollection(items) = &held.data else {
            log::warn!("Stream request against {} store {store}", held.data.kind());
            return 0;
        };
        let remaining: VecDeque<Entity> = if forward {
            items.values().cloned().collect()
        } else {
            items.values().rev().cloned().collect()
        };
        let cursor = OpenCursor {
            store: store.clone(),
            opened_at: held.version,
            page_size: page_size.clamp(1, self.config.cursor_page_limit.max(1)),
            remaining,
        };

        let cursor_id = self.next_cursor;
        self.next_cursor += 1;
        log::debug!(
            "Opened cursor {cursor_id} on {store} at v{} ({} items)",
            cursor.opened_at,
            cursor.remaining.len()
        );
        self.cursors.insert(cursor_id, cursor);
        cursor_id
    }

    fn next_page(&mut self, cursor_id: CursorId) -> CursorPage {
        let Some(cursor) = self.cursors.get_mut(&cursor_id) else {
            return CursorPage {
                value: Vec::new(),
                done: true,
            };
        };
        if cursor.remaining.is_empty() {
            log::debug!("Cursor {cursor_id} on {} exhausted", cursor.store);
            self.cursors.remove(&cursor_id);
            return CursorPage {
                value: Vec::new(),
                done: true,
            };
        }
        let take = cursor.page_size.min(cursor.remaining.len());
        CursorPage {
            value: cursor.remaining.drain(..take).collect(),
            done: false,
        }
    }

    fn push(
        &mut self,
        store: &StoreId,
        subscribed: bool,
        update: Update,
        originator: Option<ParticleId>,
    ) {
        if !subscribed {
            return;
        }
        let mut update = RawUpdate::from(update);
        update.originator_id = originator;
        self.stats.updates_pushed += 1;
        self.send(StoreEvent::Update {
            store: store.clone(),
            update,
        });
    }

    fn reply(&self, correlation_id: Option<CorrelationId>, reply: PortReply) {
        if let Some(correlation_id) = correlation_id {
            self.send(StoreEvent::Reply {
                correlation_id,
                reply,
            });
        }
    }

    fn send(&self, event: StoreEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Dropping store event: no context listening");
        }
    }
}

fn snapshot_of(held: &MemoryStore) -> Snapshot {
    let model = match &held.data {
        StoreData::Collection(model) => model.to_literal(),
        StoreData::Singleton(data) => data
            .iter()
            .map(|entity| ModelEntry::new(entity.clone(), [entity.id.clone()]))
            .collect(),
        StoreData::BigCollection(_) => Vec::new(),
    };
    Snapshot::new(held.version, model)
}

/// Answer for a request addressed to a store that does not exist.
fn empty_reply(request: &PortRequest) -> Option<PortReply> {
    match request {
        PortRequest::SynchronizeProxy => None,
        PortRequest::HandleGet => Some(PortReply::Entity(None)),
        PortRequest::HandleToList => Some(PortReply::List(Vec::new())),
        PortRequest::HandleStream { .. } => Some(PortReply::Cursor(0)),
        PortRequest::StreamCursorNext { .. } => Some(PortReply::Page(CursorPage {
            value: Vec::new(),
            done: true,
        })),
        _ => Some(PortReply::Ack),
    }
}

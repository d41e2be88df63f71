//! Collection proxy: a CRDT replica of an observed-remove collection.
//!
//! While `Full`, writes are applied to the local model immediately and
//! observers are notified without waiting for the round trip. The store's
//! echo carries the writer's particle id as `originator_id` and is skipped,
//! since it was already applied.
//!
//! While not `Full`, removal is not based on locally observed keys but on
//! whatever keys the store holds when the request arrives.

use uuid::Uuid;

use strata_core::{
    CrdtCollectionModel, Entity, ParticleId, Snapshot, StoreId, Update, UpdateBody,
};

use crate::error::ProxyError;
use crate::observer::{ProxyEvent, SyncModel, UpdateDetails};
use crate::port::{PortRequest, ProxyPort, RemoveItem};
use crate::proxy::sync::{ProxyShared, SyncBehavior, SyncCore};
use crate::proxy::{Proxy, ProxyConfig};
use crate::scheduler::ProxyScheduler;

/// Replica held by a collection proxy.
#[derive(Debug, Default)]
pub struct CollectionState {
    model: CrdtCollectionModel,
}

pub type CollectionProxy = Proxy<CollectionState>;

/// Whether `update` echoes a write made through this proxy.
///
/// Matches on particle only, so two handles of one particle writing
/// concurrently cannot be told apart.
fn originated_here(core: &SyncCore, update: &Update) -> bool {
    core.is_full()
        && update
            .originator_id
            .as_ref()
            .is_some_and(|originator| core.observers.has_particle(originator))
}

fn details(
    add: Vec<Entity>,
    remove: Vec<Entity>,
    originator_id: Option<ParticleId>,
) -> Option<UpdateDetails> {
    if add.is_empty() && remove.is_empty() {
        return None;
    }
    Some(UpdateDetails::Collection {
        add,
        remove,
        originator_id,
    })
}

fn data_body(store: &StoreId, update: &Update) -> ProxyError {
    ProxyError::InvalidUpdate {
        store: store.clone(),
        reason: format!("collection received a data update at v{}", update.version),
    }
}

impl SyncBehavior for CollectionState {
    fn synchronize_model(
        &mut self,
        _core: &SyncCore,
        snapshot: Snapshot,
    ) -> Result<bool, ProxyError> {
        self.model = CrdtCollectionModel::from_literal(snapshot.model);
        Ok(true)
    }

    fn preview_update(
        &self,
        core: &SyncCore,
        update: &Update,
    ) -> Result<Option<UpdateDetails>, ProxyError> {
        if originated_here(core, update) {
            return Ok(None);
        }
        let (add, remove) = match &update.body {
            UpdateBody::Add(items) => (
                items
                    .iter()
                    .filter(|item| item.effective)
                    .map(|item| item.value.clone())
                    .collect(),
                Vec::new(),
            ),
            UpdateBody::Remove(items) => (
                Vec::new(),
                items
                    .iter()
                    .filter(|item| item.effective)
                    .map(|item| {
                        self.model
                            .get_value(&item.value.id)
                            .cloned()
                            .unwrap_or_else(|| item.value.clone())
                    })
                    .collect(),
            ),
            UpdateBody::Data(_) => return Err(data_body(&core.store, update)),
        };
        Ok(details(add, remove, update.originator_id.clone()))
    }

    fn apply_update(
        &mut self,
        core: &mut SyncCore,
        update: &Update,
    ) -> Result<Option<UpdateDetails>, ProxyError> {
        if originated_here(core, update) {
            return Ok(None);
        }
        let mut add = Vec::new();
        let mut remove = Vec::new();
        match &update.body {
            UpdateBody::Add(items) => {
                for item in items {
                    if self.model.add(&item.value.id, item.value.clone(), &item.keys)? {
                        add.push(item.value.clone());
                    }
                }
            }
            UpdateBody::Remove(items) => {
                for item in items {
                    let local = self.model.get_value(&item.value.id).cloned();
                    if self.model.remove(&item.value.id, &item.keys) {
                        remove.push(local.unwrap_or_else(|| item.value.clone()));
                    }
                }
            }
            UpdateBody::Data(_) => return Err(data_body(&core.store, update)),
        }
        Ok(details(add, remove, update.originator_id.clone()))
    }

    fn model_for_sync(&self, _core: &SyncCore) -> Result<SyncModel, ProxyError> {
        Ok(SyncModel::Collection(self.model.to_list()))
    }
}

impl Proxy<CollectionState> {
    pub fn new(
        store: StoreId,
        name: impl Into<String>,
        port: ProxyPort,
        scheduler: ProxyScheduler,
        config: ProxyConfig,
    ) -> Self {
        Self::with_behavior(
            store,
            name,
            CollectionState::default(),
            port,
            scheduler,
            config,
        )
    }

    /// Every value in the collection.
    pub async fn to_list(&self) -> Result<Vec<Entity>, ProxyError> {
        let pending = {
            let shared = self.lock().await;
            if shared.core.is_full() {
                return Ok(shared.behavior.model.to_list());
            }
            self.port().request(self.id(), PortRequest::HandleToList)?
        };
        pending.recv().await?.into_list()
    }

    /// The value stored under `id`, if any.
    pub async fn fetch_all(&self, id: &str) -> Result<Option<Entity>, ProxyError> {
        let pending = {
            let shared = self.lock().await;
            if shared.core.is_full() {
                return Ok(shared.behavior.model.get_value(id).cloned());
            }
            self.port().request(self.id(), PortRequest::HandleToList)?
        };
        let list = pending.recv().await?.into_list()?;
        Ok(list.into_iter().find(|entity| entity.id == id))
    }

    /// Add `value` under membership `keys`. An empty key list gets a freshly
    /// minted key.
    pub async fn store(
        &self,
        value: Entity,
        keys: Vec<String>,
        particle: impl Into<ParticleId>,
    ) -> Result<(), ProxyError> {
        let particle = particle.into();
        let keys = if keys.is_empty() {
            vec![Uuid::new_v4().simple().to_string()]
        } else {
            keys
        };

        let mut shared = self.lock().await;
        let ProxyShared { core, behavior } = &mut *shared;
        core.port.send(
            &core.store,
            PortRequest::HandleStore {
                value: value.clone(),
                keys: keys.clone(),
                particle_id: particle.clone(),
            },
        )?;

        if !core.is_full() {
            return Ok(());
        }
        if behavior.model.add(&value.id, value.clone(), &keys)? {
            core.notify(
                ProxyEvent::Update(UpdateDetails::Collection {
                    add: vec![value],
                    remove: Vec::new(),
                    originator_id: Some(particle),
                }),
                |o| o.notify_update,
            );
        }
        Ok(())
    }

    /// Remove `keys` from the value under `id`. An empty key list removes
    /// every key observed for it.
    pub async fn remove(
        &self,
        id: &str,
        keys: Vec<String>,
        particle: impl Into<ParticleId>,
    ) -> Result<(), ProxyError> {
        let particle = particle.into();
        let mut shared = self.lock().await;
        let ProxyShared { core, behavior } = &mut *shared;

        if !core.is_full() {
            return core.port.send(
                &core.store,
                PortRequest::HandleRemove {
                    id: id.to_string(),
                    keys: Vec::new(),
                    particle_id: particle,
                },
            );
        }

        let Some(value) = behavior.model.get_value(id).cloned() else {
            return Ok(());
        };
        let keys = if keys.is_empty() {
            behavior.model.get_keys(id)
        } else {
            keys
        };
        core.port.send(
            &core.store,
            PortRequest::HandleRemove {
                id: id.to_string(),
                keys: keys.clone(),
                particle_id: particle.clone(),
            },
        )?;

        if behavior.model.remove(id, &keys) {
            core.notify(
                ProxyEvent::Update(UpdateDetails::Collection {
                    add: Vec::new(),
                    remove: vec![value],
                    originator_id: Some(particle),
                }),
                |o| o.notify_update,
            );
        }
        Ok(())
    }

    /// Remove everything.
    pub async fn clear(&self, particle: impl Into<ParticleId>) -> Result<(), ProxyError> {
        let particle = particle.into();
        let mut shared = self.lock().await;
        let ProxyShared { core, behavior } = &mut *shared;

        if !core.is_full() {
            return core.port.send(
                &core.store,
                PortRequest::HandleRemoveMultiple {
                    items: Vec::new(),
                    particle_id: particle,
                },
            );
        }

        let held = behavior.model.to_list();
        let items: Vec<RemoveItem> = held
            .iter()
            .map(|entity| RemoveItem {
                id: entity.id.clone(),
                keys: behavior.model.get_keys(&entity.id),
            })
            .collect();
        core.port.send(
            &core.store,
            PortRequest::HandleRemoveMultiple {
                items: items.clone(),
                particle_id: particle.clone(),
            },
        )?;

        let removed: Vec<Entity> = held
            .into_iter()
            .zip(items)
            .filter(|(_, item)| behavior.model.remove(&item.id, &item.keys))
            .map(|(entity, _)| entity)
            .collect();
        if !removed.is_empty() {
            core.notify(
                ProxyEvent::Update(UpdateDetails::Collection {
                    add: Vec::new(),
                    remove: removed,
                    originator_id: Some(particle),
                }),
                |o| o.notify_update,
            );
        }
        Ok(())
    }
}

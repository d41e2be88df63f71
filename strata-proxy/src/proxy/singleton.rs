//! Singleton proxy: last-writer-wins with barrier-gated suppression.
//!
//! A local write mints a barrier token and the store echoes it back on
//! the matching update. Between the write and its echo every other update
//! is a concurrent write that lost, so it is neither applied nor notified.
//!
//! ```text
//! set(v1) ─► barrier b1 ─► HandleSet(v1, b1)
//!   update v7 (barrier b0)  ─► dropped
//!   update v8 (no barrier)  ─► dropped
//!   update v9 (barrier b1)  ─► barrier cleared, model stays v1
//! ```

use strata_core::{Barrier, Entity, ParticleId, Snapshot, StoreId, SyncState, Update, UpdateBody};

use crate::error::ProxyError;
use crate::observer::{ProxyEvent, SyncModel, UpdateDetails};
use crate::port::{PortRequest, ProxyPort};
use crate::proxy::sync::{ProxyShared, SyncBehavior, SyncCore};
use crate::proxy::{Proxy, ProxyConfig};
use crate::scheduler::ProxyScheduler;

/// Replica held by a singleton proxy.
#[derive(Debug, Default)]
pub struct SingletonState {
    model: Option<Entity>,
    /// Token of the local write still waiting for its echo
    barrier: Option<Barrier>,
}

pub type SingletonProxy = Proxy<SingletonState>;

fn data_of<'a>(core: &SyncCore, update: &'a Update) -> Result<&'a Option<Entity>, ProxyError> {
    match &update.body {
        UpdateBody::Data(data) => Ok(data),
        _ => Err(ProxyError::InvalidUpdate {
            store: core.store.clone(),
            reason: format!(
                "singleton received a collection update at v{}",
                update.version
            ),
        }),
    }
}

impl SyncBehavior for SingletonState {
    fn synchronize_model(
        &mut self,
        _core: &SyncCore,
        snapshot: Snapshot,
    ) -> Result<bool, ProxyError> {
        // A newer local write is still in flight.
        if self.barrier.is_some() {
            return Ok(false);
        }
        self.model = snapshot.model.into_iter().next().map(|entry| entry.value);
        Ok(true)
    }

    fn preview_update(
        &self,
        core: &SyncCore,
        update: &Update,
    ) -> Result<Option<UpdateDetails>, ProxyError> {
        let data = data_of(core, update)?;
        Ok(Some(UpdateDetails::Singleton {
            data: data.clone(),
            originator_id: update.originator_id.clone(),
        }))
    }

    fn apply_update(
        &mut self,
        core: &mut SyncCore,
        update: &Update,
    ) -> Result<Option<UpdateDetails>, ProxyError> {
        let data = data_of(core, update)?;

        if let Some(barrier) = &self.barrier {
            if update.barrier.as_ref() == Some(barrier) {
                self.barrier = None;
                if core.state != SyncState::Full {
                    core.state = SyncState::Full;
                    core.notify(
                        ProxyEvent::Sync(SyncModel::Singleton(self.model.clone())),
                        |o| o.keep_synced && o.notify_sync,
                    );
                }
            }
            return Ok(None);
        }

        self.model = data.clone();
        Ok(Some(UpdateDetails::Singleton {
            data: data.clone(),
            originator_id: update.originator_id.clone(),
        }))
    }

    fn model_for_sync(&self, _core: &SyncCore) -> Result<SyncModel, ProxyError> {
        Ok(SyncModel::Singleton(self.model.clone()))
    }

    fn awaits_barrier(&self, barrier: &Barrier) -> bool {
        self.barrier.as_ref() == Some(barrier)
    }
}

impl Proxy<SingletonState> {
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
            SingletonState::default(),
            port,
            scheduler,
            config,
        )
    }

    /// The current value.
    pub async fn fetch(&self) -> Result<Option<Entity>, ProxyError> {
        let pending = {
            let shared = self.lock().await;
            if shared.core.is_full() {
                return Ok(shared.behavior.model.clone());
            }
            self.port().request(self.id(), PortRequest::HandleGet)?
        };
        pending.recv().await?.into_entity()
    }

    /// Barrier of the write still waiting for its echo, if any.
    pub async fn pending_barrier(&self) -> Option<Barrier> {
        self.lock().await.behavior.barrier.clone()
    }

    /// Replace the value. A value deep-equal to the cached one is a no-op.
    pub async fn set(
        &self,
        entity: Entity,
        particle: impl Into<ParticleId>,
    ) -> Result<(), ProxyError> {
        let mut shared = self.lock().await;
        if shared.behavior.model.as_ref() == Some(&entity) {
            return Ok(());
        }
        let ProxyShared { core, behavior } = &mut *shared;
        write(core, behavior, Some(entity), particle.into())
    }

    /// Clear the value. Skipped when the replica is known to be empty.
    pub async fn clear(&self, particle: impl Into<ParticleId>) -> Result<(), ProxyError> {
        let mut shared = self.lock().await;
        let ProxyShared { core, behavior } = &mut *shared;
        if core.is_full() && behavior.model.is_none() {
            return Ok(());
        }
        write(core, behavior, None, particle.into())
    }
}

fn write(
    core: &mut SyncCore,
    behavior: &mut SingletonState,
    data: Option<Entity>,
    particle: ParticleId,
) -> Result<(), ProxyError> {
    // Without a subscription no echo ever arrives, and a barrier would
    // block every later snapshot.
    let barrier = core.listener_attached.then(|| Barrier::mint(&core.store));

    behavior.model = data.clone();
    behavior.barrier = barrier.clone();

    let request = match data.clone() {
        Some(data) => PortRequest::HandleSet {
            data,
            particle_id: particle.clone(),
            barrier,
        },
        None => PortRequest::HandleClear {
            particle_id: particle.clone(),
            barrier,
        },
    };
    core.port.send(&core.store, request)?;

    core.notify(
        ProxyEvent::Update(UpdateDetails::Singleton {
            data,
            originator_id: Some(particle),
        }),
        |o| o.notify_update,
    );
    Ok(())
}

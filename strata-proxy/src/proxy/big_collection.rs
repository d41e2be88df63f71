//! Big-collection proxy: no replica, every operation goes to the store.
//!
//! Readers page through a versioned cursor opened at the store instead of
//! relying on cached membership, so registration only announces an empty
//! sync and the generic sync hooks refuse to run.

use futures_util::stream::{self, BoxStream, StreamExt};
use uuid::Uuid;

use strata_core::{Entity, ParticleId, Snapshot, StoreId, Update};

use crate::error::ProxyError;
use crate::observer::{SyncModel, UpdateDetails};
use crate::port::{CursorId, CursorPage, PortRequest, ProxyPort};
use crate::proxy::sync::{SyncBehavior, SyncCore};
use crate::proxy::{Proxy, ProxyConfig};
use crate::scheduler::ProxyScheduler;

/// Big collections keep no local state.
#[derive(Debug, Default)]
pub struct BigCollectionState;

pub type BigCollectionProxy = Proxy<BigCollectionState>;

/// Pages of a cursor as a stream.
pub type PageStream = BoxStream<'static, Result<Vec<Entity>, ProxyError>>;

impl SyncBehavior for BigCollectionState {
    fn synchronize_model(
        &mut self,
        core: &SyncCore,
        _snapshot: Snapshot,
    ) -> Result<bool, ProxyError> {
        Err(ProxyError::unsupported(&core.store, "synchronize_model"))
    }

    fn preview_update(
        &self,
        core: &SyncCore,
        _update: &Update,
    ) -> Result<Option<UpdateDetails>, ProxyError> {
        Err(ProxyError::unsupported(&core.store, "process_update"))
    }

    fn apply_update(
        &mut self,
        core: &mut SyncCore,
        _update: &Update,
    ) -> Result<Option<UpdateDetails>, ProxyError> {
        Err(ProxyError::unsupported(&core.store, "process_update"))
    }

    fn model_for_sync(&self, core: &SyncCore) -> Result<SyncModel, ProxyError> {
        Err(ProxyError::unsupported(&core.store, "model_for_sync"))
    }

    fn synchronizes(&self) -> bool {
        false
    }
}

impl Proxy<BigCollectionState> {
    pub fn new(
        store: StoreId,
        name: impl Into<String>,
        port: ProxyPort,
        scheduler: ProxyScheduler,
        config: ProxyConfig,
    ) -> Self {
        Self::with_behavior(store, name, BigCollectionState, port, scheduler, config)
    }

    /// Add `value` under `keys` and wait for the store to acknowledge.
    pub async fn store(
        &self,
        value: Entity,
        keys: Vec<String>,
        particle: impl Into<ParticleId>,
    ) -> Result<(), ProxyError> {
        let keys = if keys.is_empty() {
            vec![Uuid::new_v4().simple().to_string()]
        } else {
            keys
        };
        let pending = self.port().request(
            self.id(),
            PortRequest::HandleStore {
                value,
                keys,
                particle_id: particle.into(),
            },
        )?;
        pending.recv().await?.into_ack()
    }

    /// Remove the value under `id` and wait for the store to acknowledge.
    pub async fn remove(
        &self,
        id: &str,
        particle: impl Into<ParticleId>,
    ) -> Result<(), ProxyError> {
        let pending = self.port().request(
            self.id(),
            PortRequest::HandleRemove {
                id: id.to_string(),
                keys: Vec::new(),
                particle_id: particle.into(),
            },
        )?;
        pending.recv().await?.into_ack()
    }

    /// Open a cursor over the store's contents as of now.
    pub async fn stream(&self, page_size: usize, forward: bool) -> Result<Cursor, ProxyError> {
        let id = self.open_cursor(page_size, forward).await?;
        log::debug!("Opened cursor {id} on '{}'", self.id());
        Ok(Cursor {
            id,
            source: Some((self.port().clone(), self.id().clone())),
            closed: false,
        })
    }

    /// Open a cursor and return only its id.
    pub async fn open_cursor(&self, page_size: usize, forward: bool) -> Result<CursorId, ProxyError> {
        let pending = self
            .port()
            .request(self.id(), PortRequest::HandleStream { page_size, forward })?;
        pending.recv().await?.into_cursor()
    }

    pub async fn cursor_next(&self, cursor_id: CursorId) -> Result<CursorPage, ProxyError> {
        next_page(self.port(), self.id(), cursor_id).await
    }

    pub fn cursor_close(&self, cursor_id: CursorId) -> Result<(), ProxyError> {
        self.port()
            .send(self.id(), PortRequest::StreamCursorClose { cursor_id })
    }
}

async fn next_page(
    port: &ProxyPort,
    store: &StoreId,
    cursor_id: CursorId,
) -> Result<CursorPage, ProxyError> {
    let pending = port.request(store, PortRequest::StreamCursorNext { cursor_id })?;
    pending.recv().await?.into_page()
}

/// A cursor open at the backing store. Dropping it closes it.
pub struct Cursor {
    id: CursorId,
    /// `None` for cursors that never touch a store
    source: Option<(ProxyPort, StoreId)>,
    closed: bool,
}

impl Cursor {
    /// A cursor that is already exhausted.
    pub fn inert() -> Self {
        Self {
            id: 0,
            source: None,
            closed: true,
        }
    }

    pub fn id(&self) -> CursorId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read the next page. Once a page reports `done` the store has
    /// released the cursor and later calls return an empty done page.
    pub async fn next(&mut self) -> Result<CursorPage, ProxyError> {
        let Some((port, store)) = self.source.as_ref().filter(|_| !self.closed) else {
            return Ok(CursorPage {
                value: Vec::new(),
                done: true,
            });
        };
        let page = next_page(port, store, self.id).await?;
        if page.done {
            self.closed = true;
        }
        Ok(page)
    }

    /// Release the cursor early.
    pub fn close(&mut self) -> Result<(), ProxyError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match &self.source {
            Some((port, store)) => port.send(
                store,
                PortRequest::StreamCursorClose { cursor_id: self.id },
            ),
            None => Ok(()),
        }
    }

    /// Every remaining page as a stream; the stream ends when the cursor
    /// is exhausted or a read fails.
    pub fn into_stream(self) -> PageStream {
        stream::unfold(Some(self), |state| async move {
            let mut cursor = state?;
            match cursor.next().await {
                Ok(page) if page.done && page.value.is_empty() => None,
                Ok(page) if page.done => Some((Ok(page.value), None)),
                Ok(page) => Some((Ok(page.value), Some(cursor))),
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::debug!("Could not close cursor {}: {e}", self.id);
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{ChannelObserver, HandleOptions, ProxyEvent, Registration};
    use crate::port::{PortMessage, PortReply};
    use crate::scheduler::SchedulerConfig;
    use strata_core::SyncState;
    use tokio::sync::mpsc;

    fn fixture() -> (
        BigCollectionProxy,
        ProxyPort,
        ProxyScheduler,
        mpsc::UnboundedReceiver<PortMessage>,
    ) {
        let (port, outbound) = ProxyPort::channel();
        let scheduler = ProxyScheduler::new(SchedulerConfig::for_testing());
        let proxy = BigCollectionProxy::new(
            StoreId::new("big"),
            "big",
            port.clone(),
            scheduler.clone(),
            ProxyConfig::for_testing(),
        );
        (proxy, port, scheduler, outbound)
    }

    /// Answer correlated requests from a scripted list of replies and
    /// return the first `count` requests seen.
    fn serve(
        port: ProxyPort,
        mut outbound: mpsc::UnboundedReceiver<PortMessage>,
        replies: Vec<PortReply>,
        count: usize,
    ) -> tokio::task::JoinHandle<Vec<PortRequest>> {
        tokio::spawn(async move {
            let mut replies = replies.into_iter();
            let mut seen = Vec::new();
            while seen.len() < count {
                let Some(msg) = outbound.recv().await else {
                    break;
                };
                if let (Some(id), Some(reply)) = (msg.correlation_id, replies.next()) {
                    port.resolve(id, reply);
                }
                seen.push(msg.request);
            }
            seen
        })
    }

    #[tokio::test]
    async fn test_register_announces_empty_sync() {
        let (proxy, _port, scheduler, mut outbound) = fixture();
        let (observer, mut notes) = ChannelObserver::new();
        proxy
            .register(Registration::new("p", "h", HandleOptions::synced(), observer))
            .await
            .unwrap();

        scheduler.dispatch();
        assert_eq!(notes.try_recv().unwrap().event, ProxyEvent::Sync(SyncModel::Empty));
        // No subscription, no snapshot request.
        assert!(outbound.try_recv().is_err());
        assert_eq!(proxy.sync_state().await, SyncState::None);
    }

    #[tokio::test]
    async fn test_sync_hooks_fail_loudly() {
        let (proxy, _port, _scheduler, _outbound) = fixture();
        let err = proxy
            .on_synchronize(Snapshot::new(1, vec![]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProxyError::UnsupportedOperation {
                store: StoreId::new("big"),
                operation: "synchronize_model",
            }
        );
        assert!(proxy.on_update(Update::add(1, vec![])).await.is_err());
    }

    #[tokio::test]
    async fn test_store_and_remove_wait_for_ack() {
        let (proxy, port, _scheduler, outbound) = fixture();
        let server = serve(port, outbound, vec![PortReply::Ack, PortReply::Ack], 2);

        proxy
            .store(Entity::with_id("a"), vec!["k".into()], "p1")
            .await
            .unwrap();
        proxy.remove("a", "p1").await.unwrap();

        let seen = server.await.unwrap();
        assert!(matches!(&seen[0], PortRequest::HandleStore { value, .. } if value.id == "a"));
        assert!(matches!(&seen[1], PortRequest::HandleRemove { id, keys, .. } if id == "a" && keys.is_empty()));
    }

    #[tokio::test]
    async fn test_cursor_pages_until_done() {
        let (proxy, port, _scheduler, outbound) = fixture();
        let server = serve(
            port,
            outbound,
            vec![
                PortReply::Cursor(7),
                PortReply::Page(CursorPage {
                    value: vec![Entity::with_id("a"), Entity::with_id("b")],
                    done: false,
                }),
                PortReply::Page(CursorPage {
                    value: vec![],
                    done: true,
                }),
            ],
            3,
        );

        let mut cursor = proxy.stream(2, true).await.unwrap();
        assert_eq!(cursor.id(), 7);
        assert_eq!(cursor.next().await.unwrap().value.len(), 2);
        assert!(cursor.next().await.unwrap().done);
        assert!(cursor.is_closed());
        // Exhausted cursors answer locally.
        assert!(cursor.next().await.unwrap().done);
        drop(cursor);

        let seen = server.await.unwrap();
        assert_eq!(seen[0], PortRequest::HandleStream { page_size: 2, forward: true });
        assert_eq!(seen[2], PortRequest::StreamCursorNext { cursor_id: 7 });
    }

    #[tokio::test]
    async fn test_cursor_into_stream() {
        let (proxy, port, _scheduler, outbound) = fixture();
        let _server = serve(
            port,
            outbound,
            vec![
                PortReply::Cursor(1),
                PortReply::Page(CursorPage {
                    value: vec![Entity::with_id("a")],
                    done: false,
                }),
                PortReply::Page(CursorPage {
                    value: vec![Entity::with_id("b")],
                    done: false,
                }),
                PortReply::Page(CursorPage {
                    value: vec![],
                    done: true,
                }),
            ],
            4,
        );

        let pages: Vec<Vec<Entity>> = proxy
            .stream(1, true)
            .await
            .unwrap()
            .into_stream()
            .map(|page| page.unwrap())
            .collect()
            .await;
        assert_eq!(
            pages,
            vec![vec![Entity::with_id("a")], vec![Entity::with_id("b")]]
        );
    }

    #[tokio::test]
    async fn test_dropping_open_cursor_closes_it() {
        let (proxy, port, _scheduler, mut outbound) = fixture();
        let pending = tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.stream(10, false).await }
        });
        let open = outbound.recv().await.unwrap();
        port.resolve(open.correlation_id.unwrap(), PortReply::Cursor(3));
        let cursor = pending.await.unwrap().unwrap();
        drop(cursor);

        let close = outbound.recv().await.unwrap();
        assert_eq!(close.request, PortRequest::StreamCursorClose { cursor_id: 3 });
    }

    #[tokio::test]
    async fn test_inert_cursor() {
        let mut cursor = Cursor::inert();
        assert!(cursor.next().await.unwrap().done);
        assert!(cursor.close().is_ok());
        let pages: Vec<_> = Cursor::inert().into_stream().collect().await;
        assert!(pages.is_empty());
    }
}

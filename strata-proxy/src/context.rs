//! Per-context proxy registry and inbound event routing.
//!
//! ```text
//!  particles ──proxy_for(store)──► ProxyContext ──► StorageProxy (one per store)
//!                                       ▲                 │
//!            StoreEvent::Update ────────┤                 │ PortMessage
//!            StoreEvent::Synchronize ───┤                 ▼
//!            StoreEvent::Reply ─────────┘ ◄──────── backing store
//! ```
//!
//! Errors raised while folding an event never escape the loop: they are
//! logged and reported to the host as system exceptions.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::RwLock;

use strata_core::{ParticleId, StoreId};

use crate::error::ProxyError;
use crate::port::{PortMessage, ProxyPort, StoreEvent, SystemException};
use crate::proxy::{ProxyConfig, StorageProxy, StoreKind};
use crate::scheduler::{ProxyScheduler, SchedulerConfig};

/// Routing counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextStats {
    pub updates_routed: u64,
    pub snapshots_routed: u64,
    pub replies_routed: u64,
    /// Events for unknown stores or replies nobody waited for
    pub unroutable: u64,
    pub errors_reported: u64,
}

/// Owns the port, the scheduler and every proxy of one execution context.
#[derive(Clone)]
pub struct ProxyContext {
    port: ProxyPort,
    scheduler: ProxyScheduler,
    config: ProxyConfig,
    /// store id → proxy
    proxies: Arc<RwLock<HashMap<StoreId, StorageProxy>>>,
    stats: Arc<RwLock<ContextStats>>,
}

impl ProxyContext {
    pub fn new(port: ProxyPort, scheduler: ProxyScheduler, config: ProxyConfig) -> Self {
        Self {
            port,
            scheduler,
            config,
            proxies: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ContextStats::default())),
        }
    }

    /// Create a context together with the receiver the backing store drains.
    pub fn channel(
        scheduler: SchedulerConfig,
        config: ProxyConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PortMessage>) {
        let (port, outbound) = ProxyPort::channel();
        (
            Self::new(port, ProxyScheduler::new(scheduler), config),
            outbound,
        )
    }

    pub fn port(&self) -> &ProxyPort {
        &self.port
    }

    pub fn scheduler(&self) -> &ProxyScheduler {
        &self.scheduler
    }

    /// The proxy for `store`, created on first use.
    pub async fn proxy_for(
        &self,
        store: impl Into<StoreId>,
        kind: StoreKind,
        name: &str,
    ) -> Result<StorageProxy, ProxyError> {
        let store = store.into();
        let mut proxies = self.proxies.write().await;
        if let Some(existing) = proxies.get(&store) {
            if existing.kind() != kind {
                return Err(ProxyError::KindMismatch {
                    store,
                    bound: existing.kind().name(),
                    requested: kind.name(),
                });
            }
            return Ok(existing.clone());
        }

        log::info!("Creating {kind} proxy '{name}' for {store}");
        let proxy = StorageProxy::new(
            store.clone(),
            name,
            kind,
            self.port.clone(),
            self.scheduler.clone(),
            self.config.clone(),
        );
        proxies.insert(store, proxy.clone());
        Ok(proxy)
    }

    pub async fn get(&self, store: &StoreId) -> Option<StorageProxy> {
        self.proxies.read().await.get(store).cloned()
    }

    /// Replace the proxy for `store` with an inert one. Events for the
    /// store are dropped from then on. Returns false for unknown stores.
    pub async fn disable(&self, store: &StoreId) -> bool {
        let mut proxies = self.proxies.write().await;
        let Some(existing) = proxies.get(store) else {
            return false;
        };
        let kind = existing.kind();
        proxies.insert(store.clone(), StorageProxy::no_op(store.clone(), kind));
        log::info!("Disabled proxy for {store}");
        true
    }

    pub async fn len(&self) -> usize {
        self.proxies.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.proxies.read().await.is_empty()
    }

    /// Route one inbound event.
    pub async fn handle_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::Reply {
                correlation_id,
                reply,
            } => {
                let routed = self.port.resolve(correlation_id, reply);
                let mut stats = self.stats.write().await;
                if routed {
                    stats.replies_routed += 1;
                } else {
                    stats.unroutable += 1;
                }
            }
            StoreEvent::Update { store, update } => {
                let Some(proxy) = self.routable(&store).await else {
                    return;
                };
                let originator = update.originator_id.clone();
                let result = proxy.on_update(update).await;
                self.stats.write().await.updates_routed += 1;
                if let Err(e) = result {
                    self.report(&store, originator, "StorageProxy::on_update", e)
                        .await;
                }
            }
            StoreEvent::Synchronize { store, snapshot } => {
                let Some(proxy) = self.routable(&store).await else {
                    return;
                };
                let result = proxy.on_synchronize(snapshot).await;
                self.stats.write().await.snapshots_routed += 1;
                if let Err(e) = result {
                    self.report(&store, None, "StorageProxy::on_synchronize", e)
                        .await;
                }
            }
        }
    }

    /// Route events until the backing store hangs up.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<StoreEvent>) {
        log::info!("Proxy context started");
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        log::info!("Proxy context stopped: event channel closed");
    }

    pub async fn stats(&self) -> ContextStats {
        self.stats.read().await.clone()
    }

    async fn routable(&self, store: &StoreId) -> Option<StorageProxy> {
        let proxy = self.get(store).await;
        if proxy.is_none() {
            log::warn!("Dropping event for unknown store {store}");
            self.stats.write().await.unroutable += 1;
        }
        proxy
    }

    async fn report(
        &self,
        store: &StoreId,
        particle: Option<ParticleId>,
        method: &str,
        error: ProxyError,
    ) {
        self.stats.write().await.errors_reported += 1;
        self.port.report_exception(
            store,
            SystemException::new(particle, method, error.to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{ChannelObserver, HandleOptions, Registration};
    use crate::port::{PortReply, PortRequest};
    use serde_json::json;
    use strata_core::{RawUpdate, Snapshot, SyncState};

    fn context() -> (ProxyContext, mpsc::UnboundedReceiver<PortMessage>) {
        ProxyContext::channel(SchedulerConfig::for_testing(), ProxyConfig::for_testing())
    }

    #[tokio::test]
    async fn test_one_proxy_per_store() {
        let (ctx, _outbound) = context();
        let a = ctx.proxy_for("s1", StoreKind::Collection, "things").await.unwrap();
        let b = ctx.proxy_for("s1", StoreKind::Collection, "things").await.unwrap();
        let (observer, _rx) = ChannelObserver::new();
        a.register(Registration::new("p", "h", HandleOptions::synced(), observer))
            .await
            .unwrap();

        assert_eq!(b.as_collection().unwrap().observer_count().await, 1);
        assert_eq!(ctx.len().await, 1);
    }

    #[tokio::test]
    async fn test_kind_mismatch_rejected() {
        let (ctx, _outbound) = context();
        ctx.proxy_for("s1", StoreKind::Singleton, "var").await.unwrap();
        let err = ctx
            .proxy_for("s1", StoreKind::Collection, "var")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::KindMismatch { .. }));
    }

    #[tokio::test]
    async fn test_events_routed_to_proxy() {
        let (ctx, _outbound) = context();
        let proxy = ctx.proxy_for("s1", StoreKind::Singleton, "var").await.unwrap();
        let (observer, _rx) = ChannelObserver::new();
        proxy
            .register(Registration::new("p", "h", HandleOptions::synced(), observer))
            .await
            .unwrap();

        ctx.handle_event(StoreEvent::Synchronize {
            store: StoreId::new("s1"),
            snapshot: Snapshot::new(2, vec![]),
        })
        .await;
        let raw: RawUpdate = serde_json::from_value(json!({
            "version": 3,
            "data": {"id": "x", "rawData": {"n": 1}},
            "originatorId": "other"
        }))
        .unwrap();
        ctx.handle_event(StoreEvent::Update {
            store: StoreId::new("s1"),
            update: raw,
        })
        .await;

        assert_eq!(proxy.version().await, Some(3));
        assert_eq!(proxy.sync_state().await, SyncState::Full);
        let stats = ctx.stats().await;
        assert_eq!(stats.updates_routed, 1);
        assert_eq!(stats.snapshots_routed, 1);
    }

    #[tokio::test]
    async fn test_invalid_update_reported() {
        let (ctx, mut outbound) = context();
        ctx.proxy_for("s1", StoreKind::Collection, "things").await.unwrap();

        ctx.handle_event(StoreEvent::Update {
            store: StoreId::new("s1"),
            update: RawUpdate {
                version: 1,
                originator_id: Some(ParticleId::new("p7")),
                ..RawUpdate::default()
            },
        })
        .await;

        let msg = outbound.recv().await.unwrap();
        match msg.request {
            PortRequest::ReportException(e) => {
                assert_eq!(e.particle_id, Some(ParticleId::new("p7")));
                assert_eq!(e.method, "StorageProxy::on_update");
            }
            other => panic!("expected exception report, got {other:?}"),
        }
        assert_eq!(ctx.stats().await.errors_reported, 1);
    }

    #[tokio::test]
    async fn test_unknown_store_and_stray_reply_counted() {
        let (ctx, _outbound) = context();
        ctx.handle_event(StoreEvent::Synchronize {
            store: StoreId::new("ghost"),
            snapshot: Snapshot::default(),
        })
        .await;
        ctx.handle_event(StoreEvent::Reply {
            correlation_id: 42,
            reply: PortReply::Ack,
        })
        .await;
        assert_eq!(ctx.stats().await.unroutable, 2);
    }

    #[tokio::test]
    async fn test_disable_swaps_in_no_op() {
        let (ctx, _outbound) = context();
        ctx.proxy_for("s1", StoreKind::Collection, "things").await.unwrap();
        assert!(ctx.disable(&StoreId::new("s1")).await);
        assert!(!ctx.disable(&StoreId::new("missing")).await);

        let proxy = ctx.proxy_for("s1", StoreKind::Collection, "things").await.unwrap();
        assert!(proxy.is_no_op());
        assert!(proxy.as_no_op().unwrap().to_list().await.unwrap().is_empty());

        // Events for a disabled store are swallowed.
        ctx.handle_event(StoreEvent::Update {
            store: StoreId::new("s1"),
            update: RawUpdate {
                version: 1,
                add: Some(vec![]),
                ..RawUpdate::default()
            },
        })
        .await;
        let stats = ctx.stats().await;
        assert_eq!(stats.updates_routed, 1);
        assert_eq!(stats.errors_reported, 0);
    }

    #[tokio::test]
    async fn test_run_routes_replies_until_closed() {
        let (ctx, mut outbound) = context();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let runner = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.run(events_rx).await }
        });

        let proxy = ctx.proxy_for("s1", StoreKind::Collection, "things").await.unwrap();
        let read = tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.as_collection().unwrap().to_list().await }
        });
        let msg = outbound.recv().await.unwrap();
        events_tx
            .send(StoreEvent::Reply {
                correlation_id: msg.correlation_id.unwrap(),
                reply: PortReply::List(vec![]),
            })
            .unwrap();

        assert!(read.await.unwrap().unwrap().is_empty());
        drop(events_tx);
        runner.await.unwrap();
        assert_eq!(ctx.stats().await.replies_routed, 1);
    }
}

//! Request/response boundary to the backing store.
//!
//! ```text
//!            PortMessage (outbound, unbounded mpsc)
//! Proxy ─────────────────────────────────────────────► Backing store
//!   ▲        correlation_id ──► oneshot waiting here        │
//!   │                                                       │
//!   └──── StoreEvent::{Update, Synchronize, Reply} ◄────────┘
//! ```
//!
//! Fire-and-forget requests (subscriptions, writes) carry no correlation id.
//! Requests that need an answer are keyed by a fresh correlation id; the
//! answer comes back as `StoreEvent::Reply` and is routed to
//! [`ProxyPort::resolve`]. Marshalling to an actual wire is left to whoever
//! drains the outbound channel.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};

use strata_core::{Barrier, Entity, ParticleId, RawUpdate, Snapshot, StoreId};

use crate::error::ProxyError;

pub type CorrelationId = u64;
pub type CursorId = u64;

/// `{id, keys}` pair sent with a multi-remove.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoveItem {
    pub id: String,
    pub keys: Vec<String>,
}

/// Failure report routed to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemException {
    pub particle_id: Option<ParticleId>,
    pub method: String,
    pub message: String,
}

impl SystemException {
    pub fn new(
        particle_id: Option<ParticleId>,
        method: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            particle_id,
            method: method.into(),
            message: message.into(),
        }
    }
}

/// Requests a proxy can make of its backing store.
#[derive(Debug, Clone, PartialEq)]
pub enum PortRequest {
    /// Subscribe to change events
    InitializeProxy,
    /// Ask for `{version, model}`
    SynchronizeProxy,
    HandleGet,
    HandleToList,
    HandleSet {
        data: Entity,
        particle_id: ParticleId,
        barrier: Option<Barrier>,
    },
    HandleClear {
        particle_id: ParticleId,
        barrier: Option<Barrier>,
    },
    HandleStore {
        value: Entity,
        keys: Vec<String>,
        particle_id: ParticleId,
    },
    HandleRemove {
        id: String,
        keys: Vec<String>,
        particle_id: ParticleId,
    },
    /// An empty item list asks the store to remove everything it holds
    HandleRemoveMultiple {
        items: Vec<RemoveItem>,
        particle_id: ParticleId,
    },
    HandleStream {
        page_size: usize,
        forward: bool,
    },
    StreamCursorNext {
        cursor_id: CursorId,
    },
    StreamCursorClose {
        cursor_id: CursorId,
    },
    ReportException(SystemException),
}

/// Outbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct PortMessage {
    pub store: StoreId,
    pub correlation_id: Option<CorrelationId>,
    pub request: PortRequest,
}

/// One page read from a cursor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CursorPage {
    pub value: Vec<Entity>,
    pub done: bool,
}

/// Answers to correlated requests.
#[derive(Debug, Clone, PartialEq)]
pub enum PortReply {
    Ack,
    Entity(Option<Entity>),
    List(Vec<Entity>),
    Cursor(CursorId),
    Page(CursorPage),
}

impl PortReply {
    fn kind(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Entity(_) => "entity",
            Self::List(_) => "list",
            Self::Cursor(_) => "cursor",
            Self::Page(_) => "page",
        }
    }

    fn unexpected(self, expected: &'static str) -> ProxyError {
        ProxyError::UnexpectedReply {
            expected,
            got: self.kind().to_string(),
        }
    }

    pub fn into_ack(self) -> Result<(), ProxyError> {
        match self {
            Self::Ack => Ok(()),
            other => Err(other.unexpected("ack")),
        }
    }

    pub fn into_entity(self) -> Result<Option<Entity>, ProxyError> {
        match self {
            Self::Entity(e) => Ok(e),
            other => Err(other.unexpected("entity")),
        }
    }

    pub fn into_list(self) -> Result<Vec<Entity>, ProxyError> {
        match self {
            Self::List(list) => Ok(list),
            other => Err(other.unexpected("list")),
        }
    }

    pub fn into_cursor(self) -> Result<CursorId, ProxyError> {
        match self {
            Self::Cursor(id) => Ok(id),
            other => Err(other.unexpected("cursor")),
        }
    }

    pub fn into_page(self) -> Result<CursorPage, ProxyError> {
        match self {
            Self::Page(page) => Ok(page),
            other => Err(other.unexpected("page")),
        }
    }
}

/// Inbound events from the backing store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Change event for a subscribed proxy
    Update { store: StoreId, update: RawUpdate },
    /// Answer to `SynchronizeProxy`
    Synchronize { store: StoreId, snapshot: Snapshot },
    /// Answer to a correlated request
    Reply {
        correlation_id: CorrelationId,
        reply: PortReply,
    },
}

type PendingMap = HashMap<CorrelationId, oneshot::Sender<PortReply>>;

/// Outbound side of the backing-store boundary, shared by every proxy of a
/// context.
#[derive(Clone)]
pub struct ProxyPort {
    outbound: mpsc::UnboundedSender<PortMessage>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: Arc<AtomicU64>,
}

impl ProxyPort {
    pub fn new(outbound: mpsc::UnboundedSender<PortMessage>) -> Self {
        Self {
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create a port together with the receiver the backing store drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PortMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Send a request that expects no answer.
    pub fn send(&self, store: &StoreId, request: PortRequest) -> Result<(), ProxyError> {
        self.outbound
            .send(PortMessage {
                store: store.clone(),
                correlation_id: None,
                request,
            })
            .map_err(|_| ProxyError::PortClosed)
    }

    /// Send a request and return a handle to await its reply.
    pub fn request(&self, store: &StoreId, request: PortRequest) -> Result<PendingReply, ProxyError> {
        let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_map().insert(correlation_id, tx);

        let sent = self.outbound.send(PortMessage {
            store: store.clone(),
            correlation_id: Some(correlation_id),
            request,
        });
        if sent.is_err() {
            self.pending_map().remove(&correlation_id);
            return Err(ProxyError::PortClosed);
        }
        Ok(PendingReply {
            rx,
            correlation_id,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Route a reply to whoever is waiting on `correlation_id`.
    ///
    /// Returns false when nobody is waiting (unknown id or the waiter gave up).
    pub fn resolve(&self, correlation_id: CorrelationId, reply: PortReply) -> bool {
        let Some(tx) = self.pending_map().remove(&correlation_id) else {
            log::warn!("Reply for unknown correlation id {correlation_id}");
            return false;
        };
        tx.send(reply).is_ok()
    }

    /// Report a failure to the host. Errors are logged, never returned.
    pub fn report_exception(&self, store: &StoreId, exception: SystemException) {
        log::error!(
            "System exception in {} ({}): {}",
            exception.method,
            store,
            exception.message
        );
        if self
            .send(store, PortRequest::ReportException(exception))
            .is_err()
        {
            log::warn!("Could not report exception for '{store}': port closed");
        }
    }

    /// Number of correlated requests still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending_map().len()
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A correlated request in flight. Dropping it forgets the correlation id,
/// so a store that never answers does not leak waiters.
pub struct PendingReply {
    rx: oneshot::Receiver<PortReply>,
    correlation_id: CorrelationId,
    pending: Arc<Mutex<PendingMap>>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub async fn recv(mut self) -> Result<PortReply, ProxyError> {
        (&mut self.rx).await.map_err(|_| ProxyError::ReplyDropped)
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.correlation_id);
    }
}

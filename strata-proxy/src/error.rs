//! Errors raised by proxies, the port and the scheduler.

use strata_core::{CrdtError, StoreId, UpdateError};

/// Proxy errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyError {
    /// The backing store sent an update this proxy cannot fold
    InvalidUpdate { store: StoreId, reason: String },
    /// The operation does not exist for this kind of store
    UnsupportedOperation {
        store: StoreId,
        operation: &'static str,
    },
    /// The outbound channel to the backing store is gone
    PortClosed,
    /// The backing store dropped a request without replying
    ReplyDropped,
    /// The backing store replied with the wrong reply kind
    UnexpectedReply {
        expected: &'static str,
        got: String,
    },
    /// A store id was bound again with a different kind
    KindMismatch {
        store: StoreId,
        bound: &'static str,
        requested: &'static str,
    },
    /// A write violated the CRDT model's rules
    Crdt(CrdtError),
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUpdate { store, reason } => {
                write!(f, "Invalid update for '{store}': {reason}")
            }
            Self::UnsupportedOperation { store, operation } => {
                write!(f, "{operation} is not supported by '{store}'")
            }
            Self::PortClosed => write!(f, "Port closed"),
            Self::ReplyDropped => write!(f, "Reply dropped by backing store"),
            Self::UnexpectedReply { expected, got } => {
                write!(f, "Expected {expected} reply, got {got}")
            }
            Self::KindMismatch {
                store,
                bound,
                requested,
            } => write!(f, "'{store}' is a {bound} store, not a {requested} store"),
            Self::Crdt(e) => write!(f, "CRDT error: {e}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<CrdtError> for ProxyError {
    fn from(e: CrdtError) -> Self {
        Self::Crdt(e)
    }
}

impl ProxyError {
    pub(crate) fn invalid_update(store: &StoreId, e: UpdateError) -> Self {
        Self::InvalidUpdate {
            store: store.clone(),
            reason: e.to_string(),
        }
    }

    pub(crate) fn unsupported(store: &StoreId, operation: &'static str) -> Self {
        Self::UnsupportedOperation {
            store: store.clone(),
            operation,
        }
    }
}

/// Error returned by an observer that failed to handle a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryError {
    pub message: String,
}

impl DeliveryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Delivery failed: {}", self.message)
    }
}

impl std::error::Error for DeliveryError {}

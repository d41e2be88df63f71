//! Batched, ordered delivery of proxy notifications.
//!
//! ```text
//! enqueue(P1,H1,e1) enqueue(P1,H1,e2) enqueue(P1,H2,e3) enqueue(P2,H1,e4)
//!        │                                                    │
//!        ▼                                                    ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │ queues:  P1 ─┬─ H1: [e1, e2]          P2 ─── H1: [e4]          │
//! │              └─ H2: [e3]                                       │
//! └────────────────────────────────────────────────────────────────┘
//!        │ one tick later (tokio::task::yield_now)
//!        ▼
//! dispatch pass: P1/H1 e1 → e2, P1/H2 e3, then P2/H1 e4
//! ```
//!
//! Proxies decide *what* to notify; the scheduler decides *when*. Bursts of
//! notifications enqueued in the same turn land in a single dispatch pass.
//! Per-handle order is enqueue order; particles are drained one at a time
//! in the order they first received an event.

use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use strata_core::{HandleId, ParticleId, StoreId};

use crate::observer::{Notification, Observer};
use crate::port::{ProxyPort, SystemException};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Arm a dispatch tick on the current tokio runtime whenever events are
    /// enqueued. When false, events wait for an explicit `dispatch()`.
    pub auto_dispatch: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            auto_dispatch: true,
        }
    }
}

impl SchedulerConfig {
    /// Manual dispatch, so tests control exactly when deliveries happen.
    pub fn for_testing() -> Self {
        Self {
            auto_dispatch: false,
        }
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub dispatch_passes: u64,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Default)]
struct AtomicSchedulerStats {
    dispatch_passes: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

struct HandleQueue {
    store: StoreId,
    handle: HandleId,
    observer: Arc<dyn Observer>,
    reporter: ProxyPort,
    events: Vec<Notification>,
}

struct ParticleQueue {
    particle: ParticleId,
    handles: Vec<HandleQueue>,
}

#[derive(Default)]
struct SchedulerState {
    queues: VecDeque<ParticleQueue>,
    /// A dispatch tick has been spawned and has not started yet
    scheduled: bool,
    /// A dispatch pass is running
    dispatching: bool,
}

/// Proxy scheduler shared by every proxy of a context.
#[derive(Clone)]
pub struct ProxyScheduler {
    config: SchedulerConfig,
    state: Arc<Mutex<SchedulerState>>,
    busy: Arc<watch::Sender<bool>>,
    stats: Arc<AtomicSchedulerStats>,
}

impl ProxyScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            config,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            busy: Arc::new(busy),
            stats: Arc::new(AtomicSchedulerStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SchedulerConfig::default())
    }

    /// Queue `notification` for `observer`. Delivery failures are reported
    /// through `reporter`.
    pub fn enqueue(
        &self,
        observer: &Arc<dyn Observer>,
        reporter: &ProxyPort,
        notification: Notification,
    ) {
        let arm = {
            let mut state = self.lock();
            let index = match state
                .queues
                .iter()
                .position(|q| q.particle == notification.particle)
            {
                Some(i) => i,
                None => {
                    state.queues.push_back(ParticleQueue {
                        particle: notification.particle.clone(),
                        handles: Vec::new(),
                    });
                    state.queues.len() - 1
                }
            };
            let particle_queue = &mut state.queues[index];
            // Same handle ids on another store, or a sink swapped by
            // re-registration, get a queue of their own.
            match particle_queue.handles.iter_mut().find(|h| {
                h.handle == notification.handle
                    && h.store == notification.store
                    && std::ptr::addr_eq(Arc::as_ptr(&h.observer), Arc::as_ptr(observer))
            }) {
                Some(handle_queue) => handle_queue.events.push(notification),
                None => particle_queue.handles.push(HandleQueue {
                    store: notification.store.clone(),
                    handle: notification.handle.clone(),
                    observer: observer.clone(),
                    reporter: reporter.clone(),
                    events: vec![notification],
                }),
            }
            self.busy.send_replace(true);

            let arm = self.config.auto_dispatch && !state.scheduled;
            if arm {
                state.scheduled = true;
            }
            arm
        };

        if arm {
            self.schedule();
        }
    }

    fn schedule(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let scheduler = self.clone();
                runtime.spawn(async move {
                    tokio::task::yield_now().await;
                    scheduler.dispatch();
                });
            }
            Err(_) => {
                log::debug!("No tokio runtime; events wait for an explicit dispatch");
                self.lock().scheduled = false;
            }
        }
    }

    /// Run a dispatch pass: drain every queued event, one particle at a
    /// time. Returns the number of successful deliveries.
    ///
    /// A pass already running on another task picks up anything enqueued
    /// meanwhile, so a concurrent call returns 0 immediately.
    pub fn dispatch(&self) -> usize {
        {
            let mut state = self.lock();
            state.scheduled = false;
            if state.dispatching {
                return 0;
            }
            state.dispatching = true;
        }
        self.stats.dispatch_passes.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        loop {
            let next = {
                let mut state = self.lock();
                match state.queues.pop_front() {
                    Some(queue) => queue,
                    None => {
                        state.dispatching = false;
                        self.busy.send_replace(false);
                        break;
                    }
                }
            };

            for handle_queue in next.handles {
                for notification in &handle_queue.events {
                    if self.deliver(&handle_queue, notification) {
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }

    fn deliver(&self, queue: &HandleQueue, notification: &Notification) -> bool {
        let outcome = catch_unwind(AssertUnwindSafe(|| queue.observer.deliver(notification)));
        let message = match outcome {
            Ok(Ok(())) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "observer panicked".to_string(),
        };

        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        log::error!(
            "Error dispatching {} to {}/{}: {message}",
            notification.event.kind(),
            notification.particle,
            notification.handle
        );
        queue.reporter.report_exception(
            &notification.store,
            SystemException::new(
                Some(notification.particle.clone()),
                "ProxyScheduler::dispatch",
                message,
            ),
        );
        false
    }

    /// Whether events are queued or being delivered.
    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    /// Number of queued, undelivered events.
    pub fn pending_events(&self) -> usize {
        self.lock()
            .queues
            .iter()
            .flat_map(|q| q.handles.iter())
            .map(|h| h.events.len())
            .sum()
    }

    /// Resolves once every queue is empty and no pass is running.
    ///
    /// With `auto_dispatch` off this only resolves after someone calls
    /// `dispatch()`.
    pub async fn idle(&self) {
        let mut rx = self.busy.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|busy| !*busy).await;
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            dispatch_passes: self.stats.dispatch_passes.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

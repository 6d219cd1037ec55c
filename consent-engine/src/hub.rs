//! Approval notifications
//!
//! Two independent delivery paths fire for the same approval event:
//!
//! - **Waiters**: one-shot rendezvous keyed by consent id. At most one per id;
//!   a newer registration replaces the older one, which then resolves as
//!   timed out.
//! - **Subscribers**: live connections that receive every event. A
//!   subscriber whose channel is closed or full is dropped; the others are
//!   unaffected.

use crate::metrics::METRICS;
use crate::types::ConsentEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Default per-subscriber buffer
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<ConsentEvent>,
}

/// Registration returned by [`NotificationHub::register_wait`]
#[derive(Debug)]
pub struct WaitHandle {
    consent_id: String,
    ticket: u64,
    rx: oneshot::Receiver<ConsentEvent>,
}

impl WaitHandle {
    pub fn consent_id(&self) -> &str {
        &self.consent_id
    }
}

/// Result of waiting for an approval
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Approved(ConsentEvent),
    TimedOut,
}

/// Live subscription to every approval event
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<ConsentEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event; `None` once the hub dropped this subscriber
    pub async fn recv(&mut self) -> Option<ConsentEvent> {
        self.rx.recv().await
    }
}

#[derive(Debug)]
pub struct NotificationHub {
    waiters: Mutex<HashMap<String, Waiter>>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<ConsentEvent>>>,
    next_id: AtomicU64,
    subscriber_buffer: usize,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl NotificationHub {
    pub fn new(subscriber_buffer: usize) -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            subscriber_buffer: subscriber_buffer.max(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register the waiter for `consent_id`, replacing any earlier one
    pub fn register_wait(&self, consent_id: impl Into<String>) -> WaitHandle {
        let consent_id = consent_id.into();
        let ticket = self.next_id();
        let (tx, rx) = oneshot::channel();

        let replaced = self
            .waiters
            .lock()
            .insert(consent_id.clone(), Waiter { ticket, tx });
        if replaced.is_some() {
            debug!("Waiter for consent {} replaced by a newer registration", consent_id);
        }

        WaitHandle {
            consent_id,
            ticket,
            rx,
        }
    }

    /// Wait up to `timeout` for the approval of the handle's consent.
    ///
    /// A superseded handle resolves as [`WaitOutcome::TimedOut`]. On timeout
    /// the registration is removed unless a newer one took its place.
    pub async fn wait(&self, handle: WaitHandle, timeout: Duration) -> WaitOutcome {
        let WaitHandle {
            consent_id,
            ticket,
            rx,
        } = handle;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => WaitOutcome::Approved(event),
            Ok(Err(_)) => {
                debug!("Waiter for consent {} was superseded", consent_id);
                WaitOutcome::TimedOut
            }
            Err(_) => {
                self.remove_waiter(&consent_id, ticket);
                WaitOutcome::TimedOut
            }
        }
    }

    /// Register and wait in one step
    pub async fn wait_for(&self, consent_id: &str, timeout: Duration) -> WaitOutcome {
        let handle = self.register_wait(consent_id);
        self.wait(handle, timeout).await
    }

    /// Drop a registration the caller no longer needs
    pub fn cancel_wait(&self, handle: &WaitHandle) {
        self.remove_waiter(&handle.consent_id, handle.ticket);
    }

    fn remove_waiter(&self, consent_id: &str, ticket: u64) {
        let mut waiters = self.waiters.lock();
        if waiters.get(consent_id).map(|w| w.ticket) == Some(ticket) {
            waiters.remove(consent_id);
        }
    }

    /// Deliver to the waiter registered under `consent_id`, if any
    pub fn notify_waiter(&self, consent_id: &str, event: &ConsentEvent) -> bool {
        let waiter = self.waiters.lock().remove(consent_id);
        match waiter {
            Some(waiter) => waiter.tx.send(event.clone()).is_ok(),
            None => false,
        }
    }

    /// Add a live subscriber
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id();
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);

        let count = {
            let mut subscribers = self.subscribers.lock();
            subscribers.insert(id, tx);
            subscribers.len()
        };
        METRICS.live_subscribers.set(count as i64);
        info!("Subscriber {} connected ({} live)", id, count);

        Subscription { id, rx }
    }

    /// Remove a subscriber explicitly, e.g. when its connection closes
    pub fn unsubscribe(&self, id: u64) {
        let count = {
            let mut subscribers = self.subscribers.lock();
            subscribers.remove(&id);
            subscribers.len()
        };
        METRICS.live_subscribers.set(count as i64);
    }

    /// Send `event` to every subscriber; returns how many received it
    pub fn broadcast(&self, event: &ConsentEvent) -> usize {
        let mut delivered = 0;
        let count = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(e) => {
                    warn!("Dropping subscriber {}: {}", id, e);
                    false
                }
            });
            subscribers.len()
        };
        METRICS.live_subscribers.set(count as i64);
        delivered
    }

    /// Tell waiters and subscribers that a consent was approved
    pub fn notify_approved(&self, event: &ConsentEvent) {
        let waited = self.notify_waiter(&event.consent_id, event);
        let delivered = self.broadcast(event);
        debug!(
            "Approval of {} delivered to waiter: {}, subscribers: {}",
            event.consent_id, waited, delivered
        );
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

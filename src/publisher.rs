//! Fan-out of decoded state to subscribers.
//!
//! The registry is a small vector of observer callbacks behind a lock.
//! [`Publisher::publish`] snapshots the registry before calling anyone, so
//! observers may subscribe or unsubscribe from inside a callback, and a
//! registration racing with a publish either sees that state or it does not,
//! never half of it.
//!
//! Only the receive loop publishes, which keeps delivery FIFO. A panicking
//! observer is logged and skipped; the others still see the state.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::protocol::InboundState;

type Observer = Arc<dyn Fn(&InboundState) + Send + Sync>;

/// Registry of state observers for one session.
pub struct Publisher {
    observers: Mutex<Vec<(u64, Observer)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Publisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    /// Register `observer`. It stays registered until the returned
    /// [`Subscription`] is dropped or the publisher is cleared.
    ///
    /// After [`Publisher::clear`] the observer is dropped immediately and
    /// the subscription is inert.
    pub fn subscribe<F>(self: &Arc<Self>, observer: F) -> Subscription
    where
        F: Fn(&InboundState) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut observers = self.observers.lock();
            // Checked under the lock so a concurrent clear() cannot miss us.
            if self.closed.load(Ordering::Acquire) {
                return Subscription::inert(id);
            }
            observers.push((id, Arc::new(observer)));
        }

        Subscription {
            id,
            publisher: Arc::downgrade(self),
        }
    }

    /// Register a channel-backed observer.
    pub fn subscribe_channel(self: &Arc<Self>) -> StateReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |state| {
            let _ = tx.send(state.clone());
        });
        StateReceiver {
            rx,
            _subscription: subscription,
        }
    }

    /// Deliver `state` to every observer registered at the time of the call.
    pub fn publish(&self, state: &InboundState) {
        let snapshot: Vec<Observer> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        for observer in snapshot {
            if panic::catch_unwind(AssertUnwindSafe(|| observer(state))).is_err() {
                tracing::error!("Subscriber panicked while handling state");
            }
        }
    }

    /// Drop every registration and refuse new ones.
    pub fn clear(&self) {
        let released = {
            let mut observers = self.observers.lock();
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *observers)
        };

        if !released.is_empty() {
            tracing::debug!(count = released.len(), "Released subscriber registrations");
        }
    }

    /// Number of live registrations.
    pub fn subscriber_count(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn unsubscribe(&self, id: u64) -> bool {
        let removed = {
            let mut observers = self.observers.lock();
            observers
                .iter()
                .position(|(existing, _)| *existing == id)
                .map(|index| observers.remove(index))
        };
        removed.is_some()
    }
}

/// Handle to a registration. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    publisher: Weak<Publisher>,
}

impl Subscription {
    fn inert(id: u64) -> Self {
        Self {
            id,
            publisher: Weak::new(),
        }
    }

    /// Remove the registration now.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Whether the observer is still registered.
    pub fn is_active(&self) -> bool {
        self.publisher.upgrade().map_or(false, |publisher| {
            publisher
                .observers
                .lock()
                .iter()
                .any(|(existing, _)| *existing == self.id)
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(publisher) = self.publisher.upgrade() {
            publisher.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Async receiver of published states.
///
/// Yields `None` once the session releases its registrations.
pub struct StateReceiver {
    rx: mpsc::UnboundedReceiver<InboundState>,
    _subscription: Subscription,
}

impl StateReceiver {
    pub async fn recv(&mut self) -> Option<InboundState> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InboundState> {
        self.rx.try_recv().ok()
    }
}

//! The bounded, lossy watch subscription (spec §4.1, §9).

use crate::metadata::Object;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Default bounded channel capacity per subscriber (spec §4.1).
pub const DEFAULT_WATCH_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub enum Event<E> {
    Created(E),
    Updated(E),
    Deleted(E),
}

pub(super) struct Subscriber<E> {
    pub(super) id: u64,
    pub(super) tx: mpsc::Sender<Event<E>>,
}

pub(super) struct Subscribers<E> {
    next_id: AtomicU64,
    subs: Mutex<Vec<Subscriber<E>>>,
}

impl<E: Object> Subscribers<E> {
    pub(super) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subs: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn subscribe(self: &Arc<Self>, capacity: usize) -> Watch<E> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subs.lock().push(Subscriber { id, tx });
        Watch {
            id,
            rx,
            subscribers: self.clone(),
        }
    }

    /// Non-blocking fan-out: a subscriber whose channel is full simply
    /// misses this event (spec §4.1 "delivery is best-effort per subscriber").
    pub(super) fn publish(&self, event: Event<E>) {
        let subs = self.subs.lock();
        for sub in subs.iter() {
            let _ = sub.tx.try_send(event.clone());
        }
    }

    fn remove(&self, id: u64) {
        self.subs.lock().retain(|s| s.id != id);
    }
}

/// A live subscription returned by [`crate::store::Store::watch`].
/// Dropping it (or calling [`Watch::stop`]) detaches it from the store.
pub struct Watch<E> {
    id: u64,
    rx: mpsc::Receiver<Event<E>>,
    subscribers: Arc<Subscribers<E>>,
}

impl<E: Object> Watch<E> {
    /// Await the next event. Returns `None` once the store itself is gone.
    pub async fn recv(&mut self) -> Option<Event<E>> {
        self.rx.recv().await
    }

    /// Drains whatever is currently buffered without waiting for more.
    pub fn try_recv(&mut self) -> Option<Event<E>> {
        self.rx.try_recv().ok()
    }

    /// Detach this subscription; equivalent to dropping it.
    pub fn stop(self) {
        // Drop impl does the work.
    }
}

impl<E> Drop for Watch<E> {
    fn drop(&mut self) {
        self.subscribers.remove(self.id);
    }
}

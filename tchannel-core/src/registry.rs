//! In-flight call tracking (§4.4).
//!
//! Two registries per connection: outbound (ids we allocated, waiting on a
//! response) and inbound (ids the peer allocated, currently running a
//! local handler). Both are guarded by `parking_lot::Mutex` rather than
//! the async mutex used for the stream halves, since registry operations
//! are always short, non-blocking map mutations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

/// Ids `0` and `1` are reserved; allocation starts at 2 and wraps back to
/// 2, skipping any id still live in the outbound registry (§4.4).
const FIRST_ALLOCATABLE_ID: u32 = 2;

/// Monotonic outbound message id allocator, shared by one connection.
pub struct IdAllocator {
    next: AtomicU32,
}

impl Default for IdAllocator {
    fn default() -> Self {
        IdAllocator { next: AtomicU32::new(FIRST_ALLOCATABLE_ID) }
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id, skipping any id for which `is_live` returns
    /// true. `is_live` is consulted only after a wraparound back to
    /// `FIRST_ALLOCATABLE_ID`, since a fresh counter can't collide before
    /// wrapping once.
    pub fn alloc(&self, is_live: impl Fn(u32) -> bool) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            let id = if id < FIRST_ALLOCATABLE_ID { FIRST_ALLOCATABLE_ID } else { id };
            if id == 0 || id == 1 {
                continue;
            }
            if !is_live(id) {
                return id;
            }
            // id wrapped back onto something still in flight; keep spinning.
        }
    }
}

/// Tracks outbound calls awaiting a response, keyed by message id.
///
/// `T` is whatever the connection layer resolves a call with — typically
/// a `Result<CallResponseHead + args, ConnectionError>`.
pub struct OutboundRegistry<T> {
    ids: IdAllocator,
    waiters: Mutex<HashMap<u32, oneshot::Sender<T>>>,
}

impl<T> Default for OutboundRegistry<T> {
    fn default() -> Self {
        OutboundRegistry { ids: IdAllocator::new(), waiters: Mutex::new(HashMap::new()) }
    }
}

impl<T> OutboundRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id and register a waiter for it in one step, so no
    /// other thread can observe the id as allocated-but-unregistered.
    pub fn register(&self) -> (u32, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock();
        let id = self.ids.alloc(|candidate| waiters.contains_key(&candidate));
        waiters.insert(id, tx);
        (id, rx)
    }

    /// Complete the waiter for `id`, if any is still registered. Returns
    /// `false` if the id was unknown (already completed, cancelled, or
    /// never ours) so callers can log a stray-response warning.
    pub fn complete(&self, id: u32, value: T) -> bool {
        let sender = self.waiters.lock().remove(&id);
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Remove the waiter for `id` without completing it (local
    /// cancellation: the caller already heard back through another path).
    pub fn remove(&self, id: u32) -> bool {
        self.waiters.lock().remove(&id).is_some()
    }

    pub fn is_live(&self, id: u32) -> bool {
        self.waiters.lock().contains_key(&id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Drain every waiter, completing each with `make_value()`. Used on
    /// connection shutdown to fail in-flight calls with a network error
    /// rather than leaving callers waiting forever (§4.2).
    pub fn fail_all(&self, mut make_value: impl FnMut() -> T) {
        let drained: Vec<_> = self.waiters.lock().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(make_value());
        }
    }
}

/// Cooperative cancellation signal for one inbound handler invocation.
/// Handlers poll [`CancelSignal::is_cancelled`] or await
/// [`CancelSignal::cancelled`]; nothing forcibly aborts the handler task
/// (§4.7: cancel is best-effort, not a forced abort).
#[derive(Clone)]
pub struct CancelSignal {
    notify: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        CancelSignal { notify: Arc::new(Notify::new()), cancelled: Arc::new(AtomicBool::new(false)) }
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`CancelSignal::cancel`] has been called. Safe to
    /// await repeatedly; resolves immediately if already cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Tracks inbound calls currently running a local handler, keyed by the
/// id the peer assigned.
#[derive(Default)]
pub struct InboundRegistry {
    handlers: Mutex<HashMap<u32, CancelSignal>>,
}

impl InboundRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that id `id` now has a handler running, returning its
    /// cancel signal. Overwrites any existing entry for `id` (a
    /// reused/stray id is a peer bug, not ours to guard against here).
    pub fn begin(&self, id: u32) -> CancelSignal {
        let signal = CancelSignal::new();
        self.handlers.lock().insert(id, signal.clone());
        signal
    }

    /// Mark `id`'s handler as finished (response sent or dropped).
    pub fn end(&self, id: u32) {
        self.handlers.lock().remove(&id);
    }

    /// Signal cancellation for `id`'s handler, if still running. Returns
    /// `false` if no handler is running for that id (already finished).
    pub fn cancel(&self, id: u32) -> bool {
        match self.handlers.lock().get(&id) {
            Some(signal) => {
                signal.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.handlers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_two_and_increment() {
        let alloc = IdAllocator::new();
        assert_eq!(alloc.alloc(|_| false), 2);
        assert_eq!(alloc.alloc(|_| false), 3);
        assert_eq!(alloc.alloc(|_| false), 4);
    }

    #[test]
    fn allocator_skips_live_ids_on_collision() {
        let alloc = IdAllocator::new();
        let live = [2u32, 3u32];
        let id = alloc.alloc(|c| live.contains(&c));
        assert_eq!(id, 4);
    }

    #[tokio::test]
    async fn outbound_registry_register_then_complete() {
        let registry: OutboundRegistry<&'static str> = OutboundRegistry::new();
        let (id, rx) = registry.register();
        assert!(registry.is_live(id));
        assert!(registry.complete(id, "response"));
        assert_eq!(rx.await.unwrap(), "response");
        assert!(!registry.is_live(id));
    }

    #[test]
    fn completing_unknown_id_returns_false() {
        let registry: OutboundRegistry<()> = OutboundRegistry::new();
        assert!(!registry.complete(999, ()));
    }

    #[tokio::test]
    async fn fail_all_drains_every_waiter() {
        let registry: OutboundRegistry<&'static str> = OutboundRegistry::new();
        let (_id1, rx1) = registry.register();
        let (_id2, rx2) = registry.register();
        assert_eq!(registry.in_flight_count(), 2);
        registry.fail_all(|| "network error");
        assert_eq!(registry.in_flight_count(), 0);
        assert_eq!(rx1.await.unwrap(), "network error");
        assert_eq!(rx2.await.unwrap(), "network error");
    }

    #[tokio::test]
    async fn cancel_signal_wakes_waiter() {
        let signal = CancelSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        assert!(!signal.is_cancelled());
        signal.cancel();
        assert!(handle.await.unwrap());
    }

    #[test]
    fn inbound_registry_tracks_and_cancels() {
        let registry = InboundRegistry::new();
        let signal = registry.begin(5);
        assert_eq!(registry.in_flight_count(), 1);
        assert!(registry.cancel(5));
        assert!(signal.is_cancelled());
        registry.end(5);
        assert_eq!(registry.in_flight_count(), 0);
        assert!(!registry.cancel(5));
    }
}

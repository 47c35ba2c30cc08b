//! Publish/subscribe dispatcher.
//!
//! Each subscription owns a bounded queue drained by its own worker task.
//! Callbacks run on the blocking pool, one at a time per subscription, so a
//! slow callback never holds up the publisher, other subscribers or the
//! runtime's async workers. Values for one subscription are delivered in
//! publish order.
//!
//! Subscribing spawns a tokio task and must happen inside a runtime.
//!
//! # Example
//!
//! ```
//! use gebug_link::bus::MessageBus;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = MessageBus::<u32>::new(16);
//! let next = bus.next_matching(|v| *v > 10);
//!
//! bus.publish(3);
//! bus.publish(42);
//! assert_eq!(next.await.unwrap(), 42);
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::DEFAULT_SUBSCRIBER_CAPACITY;

/// Identifies a subscription for [`MessageBus::unsubscribe`].
pub type SubscriptionId = u64;

/// Predicate deciding whether a subscription wants a value.
pub type Filter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Subscription<T> {
    id: SubscriptionId,
    filter: Option<Filter<T>>,
    /// Deliveries before automatic removal; 0 means unlimited.
    listen_count: usize,
    delivered: usize,
    queue: mpsc::Sender<T>,
    /// Set on unsubscribe; the worker skips whatever is still queued.
    cancelled: Arc<AtomicBool>,
}

/// A typed publish/subscribe bus.
pub struct MessageBus<T> {
    subscriptions: Mutex<Vec<Subscription<T>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl<T: Clone + Send + 'static> MessageBus<T> {
    /// Create a bus whose subscriptions queue up to `capacity` values each.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Register `callback`.
    ///
    /// With `listen_count` k > 0 the subscription is removed as soon as its
    /// k-th value is queued. The filter runs on the publisher's thread and
    /// must not call back into the bus.
    pub fn subscribe<F>(
        &self,
        callback: F,
        listen_count: usize,
        filter: Option<Filter<T>>,
    ) -> SubscriptionId
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<T>(self.capacity);
        let cancelled = Arc::new(AtomicBool::new(false));
        let callback = Arc::new(callback);

        let stop = cancelled.clone();
        tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let callback = callback.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || callback(value)).await {
                    warn!("Subscription {} callback failed: {}", id, e);
                }
            }
            debug!("Subscription {} worker finished", id);
        });

        self.lock().push(Subscription {
            id,
            filter,
            listen_count,
            delivered: 0,
            queue: tx,
            cancelled,
        });
        id
    }

    /// Subscribe for the first value matching `filter`.
    ///
    /// The subscription is registered before this returns, so a value
    /// published after the call cannot be missed.
    pub fn next_matching<P>(&self, filter: P) -> oneshot::Receiver<T>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.next_matching_with_id(filter).1
    }

    /// Like [`next_matching`](Self::next_matching), also returning the
    /// subscription id so the caller can cancel it.
    pub fn next_matching_with_id<P>(&self, filter: P) -> (SubscriptionId, oneshot::Receiver<T>)
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let id = self.subscribe(
            move |value| {
                if let Some(tx) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    let _ = tx.send(value);
                }
            },
            1,
            Some(Box::new(filter)),
        );
        (id, rx)
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    ///
    /// Values still queued for it are discarded; a callback already running
    /// finishes.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.lock();
        let Some(pos) = subs.iter().position(|sub| sub.id == id) else {
            return false;
        };
        subs.remove(pos).cancelled.store(true, Ordering::Release);
        true
    }

    /// Queue `value` for every matching subscription.
    ///
    /// Never waits. A subscriber whose queue is full misses this value.
    /// Returns the number of subscriptions the value was queued for.
    pub fn publish(&self, value: T) -> usize {
        let mut queued = 0;
        self.lock().retain_mut(|sub| {
            if let Some(filter) = &sub.filter {
                if !filter(&value) {
                    return true;
                }
            }
            match sub.queue.try_send(value.clone()) {
                Ok(()) => {
                    queued += 1;
                    sub.delivered += 1;
                    sub.listen_count == 0 || sub.delivered < sub.listen_count
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Subscription {} queue full, dropping value", sub.id);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        queued
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Remove every subscription.
    pub fn clear(&self) {
        for sub in self.lock().drain(..) {
            sub.cancelled.store(true, Ordering::Release);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscription<T>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + 'static> Default for MessageBus<T> {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn collect(rx: &mut mpsc::UnboundedReceiver<u32>, wait: Duration) -> Vec<u32> {
        let mut out = Vec::new();
        while let Ok(Some(v)) = tokio::time::timeout(wait, rx.recv()).await {
            out.push(v);
        }
        out
    }

    #[tokio::test]
    async fn test_listen_count_exact() {
        let bus = MessageBus::new(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let k = 3;

        bus.subscribe(move |v| tx.send(v).unwrap(), k, None);
        for i in 0..(k as u32 + 5) {
            bus.publish(i);
        }

        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(collect(&mut rx, Duration::from_millis(50)).await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_unlimited_in_order() {
        let bus = MessageBus::new(256);
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(move |v| tx.send(v).unwrap(), 0, None);

        for i in 0..100 {
            bus.publish(i);
        }

        let got = collect(&mut rx, Duration::from_millis(50)).await;
        assert_eq!(got, (0..100).collect::<Vec<_>>());
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_filter_and_count_interact() {
        let bus = MessageBus::new(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(move |v| tx.send(v).unwrap(), 2, Some(Box::new(|v: &u32| v % 2 == 0)));

        for i in 1..=10 {
            bus.publish(i);
        }

        assert_eq!(collect(&mut rx, Duration::from_millis(50)).await, vec![2, 4]);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = MessageBus::new(64);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = bus.subscribe(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            0,
            None,
        );

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish(1), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_drops_for_that_subscriber_only() {
        let bus = MessageBus::new(1);
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let gate = Mutex::new(gate_rx);
        let (fast_tx, mut fast_rx) = mpsc::unbounded_channel();

        // Blocks its worker until released.
        bus.subscribe(
            move |_| {
                let _ = gate.lock().unwrap().recv();
            },
            0,
            None,
        );
        bus.subscribe(move |v| fast_tx.send(v).unwrap(), 0, None);

        let mut queued = 0;
        for i in 0..5 {
            queued += bus.publish(i);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(queued < 10);
        assert_eq!(
            collect(&mut fast_rx, Duration::from_millis(50)).await,
            vec![0, 1, 2, 3, 4]
        );

        drop(gate_tx);
    }

    #[tokio::test]
    async fn test_slow_callback_does_not_stall_others() {
        let bus = MessageBus::new(8);
        let (fast_tx, mut fast_rx) = mpsc::unbounded_channel();
        bus.subscribe(|_| std::thread::sleep(Duration::from_millis(300)), 0, None);
        bus.subscribe(move |v| fast_tx.send(v).unwrap(), 0, None);

        let start = std::time::Instant::now();
        bus.publish(1u32);

        assert_eq!(fast_rx.recv().await, Some(1));
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_unsubscribe_discards_queued_values() {
        let bus = MessageBus::new(8);
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let gate = Mutex::new(gate_rx);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let id = bus.subscribe(
            move |v: u32| {
                let _ = started_tx.send(v);
                let _ = gate.lock().unwrap().recv();
                counter.fetch_add(1, Ordering::SeqCst);
            },
            0,
            None,
        );
        for i in 0..3 {
            bus.publish(i);
        }
        assert_eq!(started_rx.recv().await, Some(0));

        assert!(bus.unsubscribe(id));
        gate_tx.send(()).unwrap();
        drop(gate_tx);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(started_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_next_matching() {
        let bus = MessageBus::new(8);
        let next = bus.next_matching(|v: &u32| *v == 7);
        assert_eq!(bus.subscriber_count(), 1);

        for i in 0..10 {
            bus.publish(i);
        }
        assert_eq!(next.await.unwrap(), 7);
        assert_eq!(bus.subscriber_count(), 0);
    }
}

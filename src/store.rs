//! Reactive stores
//!
//! A [`Store`] is a single mutable cell. `set` replaces the value and runs every
//! subscriber callback before returning, in the order the values were set. Subscribers
//! only see values set after they subscribed.
//!
//! Each store has one designated writer; any number of readers subscribe. [`values`]
//! adapts a store into a bounded queue for sequential `async` consumption.

use crate::channel::{self, Receiver, TrySendError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Subscriber callback.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Anything that can be subscribed to for a stream of values.
pub trait Readable<T>: Send + Sync {
    /// Begin receiving subsequent values. Dropping the returned guard unsubscribes.
    fn subscribe(&self, callback: Callback<T>) -> Subscription;
}

/// Unsubscribes when dropped (or when [`Subscription::unsubscribe`] is called).
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

struct StoreState<T> {
    value: Option<T>,
    version: u64,
    next_subscriber: u64,
    subscribers: BTreeMap<u64, Callback<T>>,
}

/// A single reactive value. Clones share the same cell.
pub struct Store<T> {
    state: Arc<Mutex<StoreState<T>>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Store<T> {
    /// A store whose value is unset.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                value: None,
                version: 0,
                next_subscriber: 0,
                subscribers: BTreeMap::new(),
            })),
        }
    }

    /// A store that starts with `value` (no notification is sent for it).
    pub fn with_value(value: T) -> Self {
        let store = Self::new();
        store.state.lock().value = Some(value);
        store
    }

    /// Replace the value and synchronously notify every subscriber.
    ///
    /// Callbacks run after the internal lock is released, so a callback may subscribe,
    /// unsubscribe, or read this store. It must not `set` this same store.
    pub fn set(&self, value: T) {
        let callbacks: Vec<Callback<T>> = {
            let mut state = self.state.lock();
            state.value = Some(value.clone());
            state.version += 1;
            state.subscribers.values().cloned().collect()
        };

        for callback in callbacks {
            callback(&value);
        }
    }

    /// Current value, if any has been set.
    pub fn get(&self) -> Option<T> {
        self.state.lock().value.clone()
    }

    /// Number of `set` calls so far.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Drop every subscriber. Used by the writer once it will never set again, which
    /// ends every [`StoreValues`] stream reading this store.
    pub fn close(&self) {
        let subscribers = std::mem::take(&mut self.state.lock().subscribers);
        drop(subscribers);
    }

    /// A read-only view that transforms each value with `f`.
    pub fn map<U, F>(&self, f: F) -> Mapped<T, U>
    where
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        Mapped {
            source: self.clone(),
            f: Arc::new(f),
        }
    }

    fn subscribe_callback(&self, callback: Callback<T>) -> Subscription {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            state.subscribers.insert(id, callback);
            id
        };

        let weak: Weak<Mutex<StoreState<T>>> = Arc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                state.lock().subscribers.remove(&id);
            }
        })
    }
}

impl<T: Clone + Send + 'static> Readable<T> for Store<T> {
    fn subscribe(&self, callback: Callback<T>) -> Subscription {
        self.subscribe_callback(callback)
    }
}

/// A store seen through a mapping function.
pub struct Mapped<T, U> {
    source: Store<T>,
    f: Arc<dyn Fn(&T) -> U + Send + Sync>,
}

impl<T, U> Readable<U> for Mapped<T, U>
where
    T: Clone + Send + 'static,
    U: 'static,
{
    fn subscribe(&self, callback: Callback<U>) -> Subscription {
        let f = self.f.clone();
        self.source
            .subscribe_callback(Arc::new(move |value: &T| callback(&f(value))))
    }
}

/// Sequential view of a store: a bounded queue fed by a subscription.
///
/// Dropping it unsubscribes.
pub struct StoreValues<T> {
    receiver: Receiver<T>,
    _subscription: Subscription,
}

impl<T> StoreValues<T> {
    /// Next value; `None` once the store is closed and the queue drained.
    pub async fn next(&mut self) -> Option<T> {
        self.receiver.recv().await
    }
}

/// Adapt a store into an `async` stream of its subsequent values.
///
/// Values arriving while `capacity` values are already queued are dropped with a warning.
pub fn values<T, R>(store: &R, capacity: usize) -> StoreValues<T>
where
    T: Clone + Send + 'static,
    R: Readable<T> + ?Sized,
{
    let (sender, receiver) = channel::channel(capacity);
    let subscription = store.subscribe(Arc::new(move |value: &T| {
        match sender.try_send(value.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("store reader is {} values behind, dropping newest value", capacity);
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("store reader is gone, dropping value");
            }
        }
    }));

    StoreValues {
        receiver,
        _subscription: subscription,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_set_notifies_synchronously() {
        let store = Store::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let _sub = store.subscribe(Arc::new(move |v: &i32| sink.lock().push(*v)));

        store.set(1);
        assert_eq!(*seen.lock(), vec![1]);
        store.set(2);
        store.set(3);
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(store.get(), Some(3));
        assert_eq!(store.version(), 3);
    }

    #[test]
    fn test_subscribe_does_not_replay_current_value() {
        let store = Store::with_value(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let _sub = store.subscribe(Arc::new(move |_: &i32| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        store.set(11);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let store = Store::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let sub = store.subscribe(Arc::new(move |_: &u8| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        store.set(1);
        sub.unsubscribe();
        store.set(2);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn test_mapped_view() {
        let store = Store::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let doubled = store.map(|v: &i32| v * 2);
        let _sub = doubled.subscribe(Arc::new(move |v: &i32| sink.lock().push(*v)));

        store.set(4);
        store.set(5);
        assert_eq!(*seen.lock(), vec![8, 10]);
    }

    #[tokio::test]
    async fn test_values_stream_in_order_and_ends_on_close() {
        let store = Store::new();
        let mut stream = values(&store, 8);

        store.set("a".to_string());
        store.set("b".to_string());
        store.close();

        assert_eq!(stream.next().await.as_deref(), Some("a"));
        assert_eq!(stream.next().await.as_deref(), Some("b"));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_dropping_values_unsubscribes() {
        let store: Store<u32> = Store::new();
        let stream = values(&store, 4);
        assert_eq!(store.subscriber_count(), 1);
        drop(stream);
        assert_eq!(store.subscriber_count(), 0);
    }
}

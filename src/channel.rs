//! Bounded stage channels
//!
//! One producer handle, one consumer handle, fixed capacity. A full channel stalls its
//! producer; closing either half is explicit (`close`) or happens when the half is dropped.
//!
//! - Closing the [`Sender`] lets the consumer drain what is buffered and then observe `None`.
//! - Closing the [`Receiver`] makes every pending and future `send` fail with
//!   [`ChannelClosed`], handing the item back.

use crate::error::ChannelClosed;
use tokio::sync::mpsc;

/// Capacity used for every inter-stage channel.
pub const DEFAULT_CAPACITY: usize = 32;

/// Create a bounded channel.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    assert!(capacity >= 1, "channel capacity must be at least 1");
    let (tx, rx) = mpsc::channel(capacity);
    (Sender { inner: tx }, Receiver { inner: rx })
}

/// Why a non-suspending send did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

/// Producer half. Deliberately not `Clone`: each channel has exactly one producer.
#[derive(Debug)]
pub struct Sender<T> {
    inner: mpsc::Sender<T>,
}

impl<T> Sender<T> {
    /// Send an item, suspending while the channel is at capacity.
    pub async fn send(&self, item: T) -> Result<(), ChannelClosed<T>> {
        self.inner
            .send(item)
            .await
            .map_err(|mpsc::error::SendError(item)| ChannelClosed(item))
    }

    /// Send without suspending.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        self.inner.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(item) => TrySendError::Full(item),
            mpsc::error::TrySendError::Closed(item) => TrySendError::Closed(item),
        })
    }

    /// Whether the consumer half has been closed or dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Completes once the consumer half is closed.
    pub async fn closed(&self) {
        self.inner.closed().await
    }

    pub fn capacity(&self) -> usize {
        self.inner.max_capacity()
    }

    /// Close the producer half. The consumer sees end-of-stream after draining.
    pub fn close(self) {
        drop(self);
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct Receiver<T> {
    inner: mpsc::Receiver<T>,
}

impl<T> Receiver<T> {
    /// Receive the next item; `None` once the producer is closed and the buffer drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.inner.recv().await
    }

    /// Receive without suspending; `None` if nothing is buffered right now.
    pub fn try_recv(&mut self) -> Option<T> {
        self.inner.try_recv().ok()
    }

    /// Close the consumer half without dropping it.
    ///
    /// Pending and future sends fail; items already buffered can still be received.
    pub fn close(&mut self) {
        self.inner.close();
    }

    /// Number of items buffered right now.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

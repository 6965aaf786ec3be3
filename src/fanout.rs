//! Fan-out send - deliver one event to several channels, proceed on the first success.
//!
//! All branches start together and every pass polls each of them, so every consumer that
//! has room gets the event right away. Once a pass has at least one delivery, the branches
//! still waiting are dropped, which cancels their sends: a slow consumer misses that event
//! instead of stalling the producer.

use crate::channel::Sender;
use crate::error::FanOutError;
use futures::future::{poll_fn, BoxFuture};
use futures::FutureExt;
use std::future::Future;
use std::task::Poll;

/// One send of a fan-out, labelled for the logs.
pub struct Branch<'a> {
    label: &'static str,
    send: BoxFuture<'a, bool>,
}

impl<'a> Branch<'a> {
    pub fn new<T: Send + 'a>(label: &'static str, sender: &'a Sender<T>, item: T) -> Self {
        Self {
            label,
            send: async move { sender.send(item).await.is_ok() }.boxed(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

/// Run every branch until at least one delivers; returns the labels that delivered.
///
/// Fails only when every branch failed (all consumers closed) or there were none.
pub async fn at_least_one(branches: Vec<Branch<'_>>) -> Result<Vec<&'static str>, FanOutError> {
    let attempted = branches.len();
    let mut in_flight = branches;
    let mut delivered = Vec::new();

    poll_fn(|cx| {
        let mut index = 0;
        while index < in_flight.len() {
            match in_flight[index].send.as_mut().poll(cx) {
                Poll::Ready(ok) => {
                    let branch = in_flight.remove(index);
                    if ok {
                        delivered.push(branch.label);
                    } else {
                        log::debug!("fan-out branch {} failed: consumer closed", branch.label);
                    }
                }
                Poll::Pending => index += 1,
            }
        }

        if !delivered.is_empty() || in_flight.is_empty() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    })
    .await;

    if delivered.is_empty() {
        return Err(FanOutError { attempted });
    }
    if !in_flight.is_empty() {
        let cancelled: Vec<&str> = in_flight.iter().map(Branch::label).collect();
        log::trace!("fan-out delivered via {:?}, cancelling {:?}", delivered, cancelled);
    }
    Ok(delivered)
}

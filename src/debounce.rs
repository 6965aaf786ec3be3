//! Debouncer - fire an action only after a quiet window with no new activity.
//!
//! `trigger` restarts the window with a new payload, `suppress` cancels it. At most one
//! timer is pending; when one is allowed to elapse its action runs exactly once with the
//! payload of the `trigger` call that started it.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

type Action<P> = Arc<dyn Fn(P) -> BoxFuture<'static, ()> + Send + Sync>;

struct Pending {
    handle: JoinHandle<()>,
    generation: u64,
}

struct DebounceState<P> {
    pending: Option<Pending>,
    last_payload: Option<P>,
    generation: u64,
    fired: u64,
}

pub struct Debouncer<P> {
    window: Duration,
    action: Action<P>,
    state: Arc<Mutex<DebounceState<P>>>,
    runtime: Handle,
}

impl<P> Debouncer<P>
where
    P: Clone + Send + 'static,
{
    /// # Panics
    ///
    /// Panics outside a Tokio runtime.
    pub fn new<F>(window: Duration, action: F) -> Self
    where
        F: Fn(P) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self {
            window,
            action: Arc::new(action),
            state: Arc::new(Mutex::new(DebounceState {
                pending: None,
                last_payload: None,
                generation: 0,
                fired: 0,
            })),
            runtime: Handle::current(),
        }
    }

    /// Cancel any pending timer and start a new quiet window carrying `payload`.
    pub fn trigger(&self, payload: P) {
        let mut state = self.state.lock();
        if let Some(previous) = state.pending.take() {
            previous.handle.abort();
        }

        state.generation += 1;
        let generation = state.generation;
        state.last_payload = Some(payload.clone());

        let window = self.window;
        let action = self.action.clone();
        let shared = self.state.clone();
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(window).await;
            {
                let mut state = shared.lock();
                if state.pending.as_ref().map(|p| p.generation) != Some(generation) {
                    return;
                }
                // No longer pending: a later trigger/suppress must not abort the action itself.
                state.pending = None;
                state.fired += 1;
            }
            action(payload).await;
        });

        state.pending = Some(Pending { handle, generation });
    }

    /// Cancel any pending timer without scheduling a new one.
    pub fn suppress(&self) {
        if let Some(previous) = self.state.lock().pending.take() {
            previous.handle.abort();
            log::debug!("pending debounced action suppressed");
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Payload of the most recent `trigger`.
    pub fn last_payload(&self) -> Option<P> {
        self.state.lock().last_payload.clone()
    }

    /// How many times the action has fired.
    pub fn fired(&self) -> u64 {
        self.state.lock().fired
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl<P> Drop for Debouncer<P> {
    fn drop(&mut self) {
        if let Some(pending) = self.state.lock().pending.take() {
            pending.handle.abort();
        }
    }
}

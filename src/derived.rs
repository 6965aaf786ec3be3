//! Derived stores - combine N input stores into one output store on a staleness deadline.
//!
//! Nothing is computed until every input has reported at least once. After that, every
//! input update recomputes exactly once, and a single staleness timer forces a
//! recomputation (with the same latest values) whenever `max_staleness` passes without one.
//! That keeps time-dependent combine functions such as schedule lookups from going stale.

use crate::store::{Readable, Store, Subscription};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Most inputs a single derived store can combine (one bit each in the pending mask).
pub const MAX_INPUTS: usize = 64;

type Combine<V, O> = Box<dyn Fn(&[&V]) -> O + Send + Sync>;

struct DerivedState<V> {
    latest: Vec<Option<V>>,
    /// Bit `i` set while input `i` has never reported.
    pending: u64,
    timer: Option<JoinHandle<()>>,
    /// Bumped every time a timer is armed; a timer only acts if it is still current.
    generation: u64,
    computations: u64,
    stopped: bool,
}

struct Inner<V, O> {
    state: Mutex<DerivedState<V>>,
    combine: Combine<V, O>,
    output: Store<O>,
    max_staleness: Duration,
    runtime: Handle,
}

impl<V, O> Inner<V, O>
where
    V: Clone + Send + 'static,
    O: Clone + Send + 'static,
{
    fn on_input(self: &Arc<Self>, index: usize, value: &V) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }

        state.latest[index] = Some(value.clone());
        state.pending &= !(1u64 << index);

        if state.pending == 0 {
            self.recompute(&mut state);
        }
    }

    fn on_deadline(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if state.stopped || state.generation != generation {
            return;
        }

        // This handle belongs to the task running right now; detach it rather than abort it.
        state.timer.take();
        log::trace!("staleness deadline of {:?} passed, recomputing", self.max_staleness);
        self.recompute(&mut state);
    }

    /// Runs with the state lock held so recomputations and their output never interleave.
    fn recompute(self: &Arc<Self>, state: &mut DerivedState<V>) {
        let result = {
            let latest: Vec<&V> = state.latest.iter().flatten().collect();
            (self.combine)(&latest)
        };
        state.computations += 1;
        self.output.set(result);
        self.arm_timer(state);
    }

    fn arm_timer(self: &Arc<Self>, state: &mut DerivedState<V>) {
        if let Some(previous) = state.timer.take() {
            previous.abort();
        }

        state.generation += 1;
        let generation = state.generation;
        let delay = self.max_staleness;
        let weak: Weak<Self> = Arc::downgrade(self);

        state.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_deadline(generation);
            }
        }));
    }
}

/// Output store plus the machinery that keeps it up to date. Dropping it tears down.
pub struct DerivedStore<V, O> {
    inner: Arc<Inner<V, O>>,
    subscriptions: Vec<Subscription>,
}

impl<V, O> DerivedStore<V, O>
where
    V: Clone + Send + 'static,
    O: Clone + Send + 'static,
{
    /// Subscribe to `inputs` and start deriving.
    ///
    /// Output subscribers run while the derivation is locked, so they must not set any
    /// of the inputs.
    ///
    /// # Panics
    ///
    /// Panics outside a Tokio runtime, or with more than [`MAX_INPUTS`] inputs.
    pub fn new<F>(inputs: &[&dyn Readable<V>], combine: F, max_staleness: Duration) -> Self
    where
        F: Fn(&[&V]) -> O + Send + Sync + 'static,
    {
        let n = inputs.len();
        assert!(n <= MAX_INPUTS, "a derived store combines at most {} inputs", MAX_INPUTS);

        let pending = if n == MAX_INPUTS {
            u64::MAX
        } else {
            (1u64 << n) - 1
        };

        let inner = Arc::new(Inner {
            state: Mutex::new(DerivedState {
                latest: vec![None; n],
                pending,
                timer: None,
                generation: 0,
                computations: 0,
                stopped: false,
            }),
            combine: Box::new(combine),
            output: Store::new(),
            max_staleness,
            runtime: Handle::current(),
        });

        if n == 0 {
            let mut state = inner.state.lock();
            inner.recompute(&mut state);
        }

        let subscriptions = inputs
            .iter()
            .enumerate()
            .map(|(index, input)| {
                let weak = Arc::downgrade(&inner);
                input.subscribe(Arc::new(move |value: &V| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_input(index, value);
                    }
                }))
            })
            .collect();

        Self {
            inner,
            subscriptions,
        }
    }

    /// The derived output. Unset until every input has reported once.
    pub fn output(&self) -> &Store<O> {
        &self.inner.output
    }

    /// How many times `combine` has run.
    pub fn computations(&self) -> u64 {
        self.inner.state.lock().computations
    }

    /// Whether a staleness timer is currently armed.
    pub fn timer_armed(&self) -> bool {
        self.inner.state.lock().timer.is_some()
    }

    /// Cancel the staleness timer and unsubscribe from every input.
    pub fn stop(self) {
        drop(self);
    }
}

impl<V, O> Drop for DerivedStore<V, O> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.stopped = true;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        drop(state);
        self.subscriptions.clear();
    }
}

//! In-flight guard: concurrent callers share one running operation.

use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

/// The running operation, held weakly so that it dies with its last caller.
struct InFlight<T> {
    generation: u64,
    future: WeakShared<BoxFuture<'static, T>>,
}

struct SlotState<T> {
    next_generation: u64,
    current: Option<InFlight<T>>,
}

type Slot<T> = Arc<Mutex<SlotState<T>>>;

/// Runs at most one instance of an operation at a time.
///
/// While an operation started by [`OneFlight::run`] is pending, further calls
/// return the same shared future instead of starting a new one. The slot is
/// cleared as soon as the operation completes, or once every caller has
/// dropped its future.
pub struct OneFlight<T: Clone> {
    slot: Slot<T>,
}

impl<T: Clone> Default for OneFlight<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(SlotState {
                next_generation: 0,
                current: None,
            })),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> OneFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self) -> bool {
        let weak = self.slot.lock().current.as_ref().map(|r| r.future.clone());
        weak.and_then(|w| w.upgrade()).is_some()
    }

    /// Join the running operation, or start `f()` if none is running.
    pub fn run<F, Fut>(&self, f: F) -> Shared<BoxFuture<'static, T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut state = self.slot.lock();
        if let Some(existing) = state.current.as_ref().and_then(|r| r.future.upgrade()) {
            return existing;
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let guard = ResetOnDrop {
            slot: self.slot.clone(),
            generation,
        };
        let fut = f();
        let shared = async move {
            let _guard = guard;
            fut.await
        }
        .boxed()
        .shared();
        state.current = shared.downgrade().map(|future| InFlight { generation, future });
        shared
    }
}

/// Clears the slot when the operation finishes or is dropped, unless a newer
/// operation already took it.
struct ResetOnDrop<T> {
    slot: Slot<T>,
    generation: u64,
}

impl<T> Drop for ResetOnDrop<T> {
    fn drop(&mut self) {
        let mut state = self.slot.lock();
        if state
            .current
            .as_ref()
            .is_some_and(|running| running.generation == self.generation)
        {
            state.current = None;
        }
    }
}

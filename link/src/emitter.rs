//! Named-event fan-out.
//!
//! [`EventSink`] is the one capability shared by every component that
//! publishes events; [`transfer_events`] forwards events between sinks using
//! nothing but that trait.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared listener callback.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by [`EventSink::on`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Anything that can publish named events to subscribed listeners.
pub trait EventSink<T>: Send + Sync {
    /// Invoke every listener registered for `name`, in subscription order.
    /// A panicking listener is logged and does not stop the others.
    fn emit(&self, name: &str, payload: &T);

    fn on(&self, name: &str, listener: Listener<T>) -> ListenerId;

    /// Returns `false` if no such listener was registered.
    fn off(&self, name: &str, id: ListenerId) -> bool;
}

/// Default [`EventSink`] implementation.
pub struct Emitter<T> {
    listeners: RwLock<HashMap<String, Vec<(ListenerId, Listener<T>)>>>,
    next_id: AtomicU64,
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.read();
        let mut names: Vec<&String> = listeners.keys().collect();
        names.sort();
        f.debug_struct("Emitter").field("events", &names).finish()
    }
}

impl<T> Emitter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.read().get(name).map_or(0, Vec::len)
    }

    /// Snapshot of the listeners for `name`. Emitting from a snapshot lets a
    /// listener subscribe or unsubscribe without deadlocking.
    fn snapshot(&self, name: &str) -> Vec<Listener<T>> {
        self.listeners
            .read()
            .get(name)
            .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }
}

impl<T: Send + Sync> EventSink<T> for Emitter<T> {
    fn emit(&self, name: &str, payload: &T) {
        for listener in self.snapshot(name) {
            if catch_unwind(AssertUnwindSafe(|| listener(payload))).is_err() {
                log::error!("[mercury] listener for '{}' panicked", name);
            }
        }
    }

    fn on(&self, name: &str, listener: Listener<T>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(name.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    fn off(&self, name: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(name);
        }
        removed
    }
}

/// Re-emit each of `names` from `source` on `target`.
///
/// Returns the listener ids registered on `source` so the forwarding can be
/// undone with [`EventSink::off`].
pub fn transfer_events<T: 'static>(
    source: &dyn EventSink<T>,
    target: Arc<dyn EventSink<T>>,
    names: &[&str],
) -> Vec<(String, ListenerId)> {
    names
        .iter()
        .map(|name| {
            let target = target.clone();
            let forwarded = name.to_string();
            let id = source.on(
                name,
                Arc::new(move |payload: &T| target.emit(&forwarded, payload)),
            );
            (name.to_string(), id)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Listener<u32> {
        let log = log.clone();
        Arc::new(move |v: &u32| log.lock().push(format!("{}:{}", tag, v)))
    }

    #[test]
    fn test_listeners_run_in_subscription_order() {
        let emitter = Emitter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        emitter.on("event", recorder(&log, "a"));
        emitter.on("event", recorder(&log, "b"));
        emitter.on("other", recorder(&log, "c"));

        emitter.emit("event", &1);

        assert_eq!(*log.lock(), vec!["a:1", "b:1"]);
    }

    #[test]
    fn test_off_removes_only_that_listener() {
        let emitter = Emitter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = emitter.on("event", recorder(&log, "a"));
        emitter.on("event", recorder(&log, "b"));

        assert!(emitter.off("event", a));
        assert!(!emitter.off("event", a));
        emitter.emit("event", &2);

        assert_eq!(*log.lock(), vec!["b:2"]);
        assert_eq!(emitter.listener_count("event"), 1);
    }

    #[test]
    fn test_listener_may_subscribe_during_emit() {
        let emitter: Arc<Emitter<u32>> = Arc::new(Emitter::new());
        let inner = emitter.clone();
        emitter.on(
            "event",
            Arc::new(move |_: &u32| {
                inner.on("late", Arc::new(|_: &u32| {}));
            }),
        );
        emitter.emit("event", &0);
        assert_eq!(emitter.listener_count("late"), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let emitter = Emitter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        emitter.on("event", Arc::new(|_: &u32| panic!("listener failure")));
        emitter.on("event", recorder(&log, "after"));

        emitter.emit("event", &3);

        assert_eq!(*log.lock(), vec!["after:3"]);
    }

    #[test]
    fn test_transfer_events_forwards_named_events() {
        let source = Emitter::new();
        let target: Arc<Emitter<u32>> = Arc::new(Emitter::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        target.on("online", recorder(&log, "t"));

        let ids = transfer_events(&source, target.clone(), &["online", "offline"]);
        source.emit("online", &7);
        source.emit("unrelated", &8);

        assert_eq!(ids.len(), 2);
        assert_eq!(*log.lock(), vec!["t:7"]);

        for (name, id) in ids {
            source.off(&name, id);
        }
        source.emit("online", &9);
        assert_eq!(log.lock().len(), 1);
    }
}

//! Fingerprint cache: one outcome per equivalent request.

use std::collections::HashMap;
use tokio::sync::oneshot;

use crate::error::Result;

enum CacheEntry<T> {
    InFlight(Vec<oneshot::Sender<Result<T>>>),
    Settled(Result<T>),
}

/// Result of [`FingerprintCache::get_or_create`].
pub enum Lookup<T> {
    /// A retained outcome.
    Settled(Result<T>),
    /// Resolves when the fingerprint settles.
    Pending(oneshot::Receiver<Result<T>>),
}

impl<T> std::fmt::Debug for Lookup<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lookup::Settled(r) => write!(f, "Settled(ok={})", r.is_ok()),
            Lookup::Pending(_) => write!(f, "Pending"),
        }
    }
}

/// Maps a fingerprint to an in-flight or retained outcome.
///
/// Settled entries are evicted immediately unless the matching retention
/// flag is set, in which case they stay until invalidated.
pub struct FingerprintCache<T> {
    entries: HashMap<String, CacheEntry<T>>,
    cache_successes: bool,
    cache_failures: bool,
}

impl<T: Clone> FingerprintCache<T> {
    pub fn new(cache_successes: bool, cache_failures: bool) -> Self {
        Self {
            entries: HashMap::new(),
            cache_successes,
            cache_failures,
        }
    }

    /// Join the outcome for `fingerprint`, or register a new in-flight
    /// entry and call `factory` to start the work.
    ///
    /// If `factory` fails, the entry is removed and its error returned as a
    /// settled outcome.
    pub fn get_or_create<F>(&mut self, fingerprint: &str, factory: F) -> Lookup<T>
    where
        F: FnOnce() -> Result<()>,
    {
        let (tx, rx) = oneshot::channel();
        match self.entries.get_mut(fingerprint) {
            Some(CacheEntry::Settled(result)) => return Lookup::Settled(result.clone()),
            Some(CacheEntry::InFlight(waiters)) => {
                waiters.push(tx);
                return Lookup::Pending(rx);
            },
            None => {},
        }

        self.entries
            .insert(fingerprint.to_string(), CacheEntry::InFlight(vec![tx]));
        if let Err(e) = factory() {
            self.entries.remove(fingerprint);
            return Lookup::Settled(Err(e));
        }
        Lookup::Pending(rx)
    }

    /// Deliver `result` to every waiter of `fingerprint`. Returns the number
    /// of waiters reached; zero if nothing was in flight.
    pub fn settle(&mut self, fingerprint: &str, result: Result<T>) -> usize {
        let Some(CacheEntry::InFlight(waiters)) = self.entries.remove(fingerprint) else {
            return 0;
        };
        let mut delivered = 0;
        for waiter in waiters {
            if waiter.send(result.clone()).is_ok() {
                delivered += 1;
            }
        }
        let retain = match &result {
            Ok(_) => self.cache_successes,
            Err(_) => self.cache_failures,
        };
        if retain {
            self.entries
                .insert(fingerprint.to_string(), CacheEntry::Settled(result));
        }
        delivered
    }

    /// Drop a retained outcome. In-flight entries are left alone.
    pub fn invalidate(&mut self, fingerprint: &str) -> bool {
        if matches!(self.entries.get(fingerprint), Some(CacheEntry::Settled(_))) {
            self.entries.remove(fingerprint);
            return true;
        }
        false
    }

    /// Drop every retained outcome.
    pub fn clear(&mut self) {
        self.entries
            .retain(|_, entry| matches!(entry, CacheEntry::InFlight(_)));
    }

    pub fn is_in_flight(&self, fingerprint: &str) -> bool {
        matches!(self.entries.get(fingerprint), Some(CacheEntry::InFlight(_)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MercuryError;

    fn pending(lookup: Lookup<u32>) -> oneshot::Receiver<Result<u32>> {
        match lookup {
            Lookup::Pending(rx) => rx,
            other => panic!("expected pending, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_lookup_joins_in_flight_entry() {
        let mut cache = FingerprintCache::new(false, false);
        let mut calls = 0;
        let a = pending(cache.get_or_create("uuid-80", || {
            calls += 1;
            Ok(())
        }));
        let b = pending(cache.get_or_create("uuid-80", || {
            calls += 1;
            Ok(())
        }));
        assert_eq!(calls, 1);
        assert!(cache.is_in_flight("uuid-80"));

        assert_eq!(cache.settle("uuid-80", Ok(7)), 2);
        assert_eq!(a.await.unwrap().unwrap(), 7);
        assert_eq!(b.await.unwrap().unwrap(), 7);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_retains_successes_when_configured() {
        let mut cache = FingerprintCache::new(true, false);
        let rx = pending(cache.get_or_create("k", || Ok(())));
        cache.settle("k", Ok(1));
        assert_eq!(rx.await.unwrap().unwrap(), 1);

        match cache.get_or_create("k", || panic!("factory must not run")) {
            Lookup::Settled(Ok(v)) => assert_eq!(v, 1),
            other => panic!("unexpected {:?}", other),
        }

        assert!(cache.invalidate("k"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_failures_evicted_unless_retained() {
        let mut cache = FingerprintCache::<u32>::new(false, false);
        let _rx = cache.get_or_create("k", || Ok(()));
        cache.settle("k", Err(MercuryError::Cancelled("x".into())));
        assert!(cache.is_empty());

        let mut cache = FingerprintCache::<u32>::new(false, true);
        let _rx = cache.get_or_create("k", || Ok(()));
        cache.settle("k", Err(MercuryError::Cancelled("x".into())));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_factory_error_settles_immediately() {
        let mut cache = FingerprintCache::<u32>::new(false, false);
        let lookup = cache.get_or_create("k", || {
            Err(MercuryError::ConfigurationError("no queue".into()))
        });
        assert!(matches!(lookup, Lookup::Settled(Err(_))));
        assert!(!cache.is_in_flight("k"));
    }

    #[test]
    fn test_settle_unknown_fingerprint_is_noop() {
        let mut cache = FingerprintCache::<u32>::new(true, true);
        assert_eq!(cache.settle("missing", Ok(1)), 0);
        assert!(cache.is_empty());
    }
}

//! Bounded, TTL-evicting caches shared by the session-key nonce tracker,
//! the paywall nonce tracker, and the rate limiter's per-key buckets.
//!
//! Same shape as a bridge operator's approved-hash/pending-execution caches:
//! a `HashMap` with a max size and a TTL, where `insert` first drops expired
//! entries and then evicts the oldest remaining entry if still at capacity.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Bounded cache for presence checks (e.g. "have we seen this nonce/hash").
pub struct BoundedSet<K: Eq + Hash + Clone> {
    map: HashMap<K, Instant>,
    max_size: usize,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone> BoundedSet<K> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            max_size,
            ttl,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.get(key).is_some_and(|&t| t.elapsed() < self.ttl)
    }

    /// Returns true if the key was newly inserted (i.e. not already present
    /// and unexpired) -- the caller uses this for one-shot replay rejection.
    pub fn insert(&mut self, key: K) -> bool {
        let now = Instant::now();
        if self.contains(&key) {
            return false;
        }
        self.map.retain(|_, t| now.duration_since(*t) < self.ttl);
        while self.map.len() >= self.max_size && !self.map.is_empty() {
            let oldest = self.map.iter().min_by_key(|(_, t)| *t).map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.map.remove(&k);
                }
                None => break,
            }
        }
        self.map.insert(key, now);
        true
    }

    /// Un-marks a key, e.g. because the action it guarded against replay
    /// ultimately failed and should be retryable.
    pub fn remove(&mut self, key: &K) -> bool {
        self.map.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Bounded cache mapping keys to values with TTL + max-size eviction.
pub struct BoundedMap<K: Eq + Hash + Clone, V> {
    map: HashMap<K, (V, Instant)>,
    max_size: usize,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V> BoundedMap<K, V> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            max_size,
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key).filter(|(_, t)| t.elapsed() < self.ttl).map(|(v, _)| v)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let ttl = self.ttl;
        self.map.get_mut(key).filter(|(_, t)| t.elapsed() < ttl).map(|(v, _)| v)
    }

    pub fn insert(&mut self, key: K, value: V) {
        let now = Instant::now();
        self.map.retain(|_, (_, t)| now.duration_since(*t) < self.ttl);
        while self.map.len() >= self.max_size && !self.map.contains_key(&key) && !self.map.is_empty() {
            let oldest = self.map.iter().min_by_key(|(_, (_, t))| *t).map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.map.remove(&k);
                }
                None => break,
            }
        }
        self.map.insert(key, (value, now));
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(v, _)| v)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drops every expired entry regardless of insert pressure -- for a
    /// periodic sweep rather than the amortized eviction `insert` already
    /// does, since a key that simply stops being used never forces that
    /// path to run again.
    pub fn prune_expired(&mut self) {
        let now = Instant::now();
        self.map.retain(|_, (_, t)| now.duration_since(*t) < self.ttl);
    }

    pub fn entry_or_insert_with(&mut self, key: K, default: impl FnOnce() -> V) -> &mut V {
        let now = Instant::now();
        if !self.map.contains_key(&key) {
            self.map.retain(|_, (_, t)| now.duration_since(*t) < self.ttl);
            while self.map.len() >= self.max_size && !self.map.is_empty() {
                let oldest = self.map.iter().min_by_key(|(_, (_, t))| *t).map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        self.map.remove(&k);
                    }
                    None => break,
                }
            }
            self.map.insert(key.clone(), (default(), now));
        }
        &mut self.map.get_mut(&key).expect("just inserted").0
    }
}

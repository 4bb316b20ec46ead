//! Token-bucket rate limiting, keyed by API key id or tenant id -- never by
//! a client-supplied header (`X-Forwarded-For` and friends are trivially
//! spoofable and must never gate a limit meant to bound a single caller).
//! Idle buckets are evicted the same way the teacher's bounded caches evict
//! idle hash entries, so a burst of one-off callers can't pin memory.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::bounded_cache::BoundedMap;

const MAX_TRACKED_KEYS: usize = 1_000_000;
const IDLE_EVICTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        TokenBucket {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiter {
    buckets: Mutex<BoundedMap<String, TokenBucket>>,
    default_rps: f64,
    burst: f64,
}

impl RateLimiter {
    /// `rps` is the steady-state refill rate; `burst` is the bucket
    /// capacity, i.e. how many requests can land instantaneously before
    /// the steady-state rate starts throttling.
    pub fn new(rps: u32, burst: u32) -> Self {
        RateLimiter {
            buckets: Mutex::new(BoundedMap::new(MAX_TRACKED_KEYS, IDLE_EVICTION)),
            default_rps: rps as f64,
            burst: burst as f64,
        }
    }

    /// Returns true if the request is allowed under `key`'s bucket.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry_or_insert_with(key.to_string(), || TokenBucket::new(self.burst, self.default_rps));
        bucket.try_consume(now)
    }

    /// Drops buckets for keys that haven't been checked in over
    /// `IDLE_EVICTION`, independent of insert pressure from other keys --
    /// a caller that stops making requests entirely would otherwise pin its
    /// bucket in memory until some other key's insert forces capacity
    /// eviction.
    pub fn sweep_idle(&self) {
        self.buckets.lock().unwrap().prune_expired();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_burst_then_blocks() {
        let limiter = RateLimiter::new(1, 3);
        let now = Instant::now();
        assert!(limiter.check_at("k", now));
        assert!(limiter.check_at("k", now));
        assert!(limiter.check_at("k", now));
        assert!(!limiter.check_at("k", now));
    }

    #[test]
    fn refills_over_time() {
        let limiter = RateLimiter::new(10, 1);
        let now = Instant::now();
        assert!(limiter.check_at("k", now));
        assert!(!limiter.check_at("k", now));
        let later = now + Duration::from_millis(200);
        assert!(limiter.check_at("k", later));
    }

    #[test]
    fn sweep_idle_does_not_disturb_active_keys() {
        let limiter = RateLimiter::new(1, 3);
        let now = Instant::now();
        assert!(limiter.check_at("k", now));
        limiter.sweep_idle();
        assert!(limiter.check_at("k", now));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, 1);
        let now = Instant::now();
        assert!(limiter.check_at("a", now));
        assert!(limiter.check_at("b", now));
        assert!(!limiter.check_at("a", now));
    }
}

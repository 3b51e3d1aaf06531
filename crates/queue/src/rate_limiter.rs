//! Retry delays: per-key exponential backoff and a queue-wide token bucket.

use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Base delay for the first retry of a key.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Upper bound for any single retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Sustained retries per second across all keys.
pub const DEFAULT_QPS: f64 = 10.0;

/// Retries allowed back to back before the bucket starts spacing them out.
pub const DEFAULT_BURST: u32 = 100;

pub trait RateLimiter<K>: Send + Sync {
    /// Record a failure for `key` and return how long to wait before retrying it.
    fn when(&self, key: &K) -> Duration;
    /// Drop all failure history for `key`.
    fn forget(&self, key: &K);
    fn num_requeues(&self, key: &K) -> u32;
}

/// Exponential backoff per key: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K: Eq + Hash> ItemExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: Mutex::new(FxHashMap::default()) }
    }

    fn delay_for(&self, exp: u32) -> Duration {
        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl<K: Eq + Hash> Default for ItemExponentialBackoff<K> {
    fn default() -> Self { Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY) }
}

impl<K: Clone + Eq + Hash + Send> RateLimiter<K> for ItemExponentialBackoff<K> {
    fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);
        self.delay_for(exp)
    }

    fn forget(&self, key: &K) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).get(key).copied().unwrap_or(0)
    }
}

/// Token bucket shared by every key.
///
/// Each call reserves a token; once the bucket is empty the returned delay is
/// the time until that reservation is covered, so a burst of retries is spread
/// at `qps` no matter how many distinct keys fail.
#[derive(Debug)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let qps = if qps.is_finite() && qps > 0.0 { qps } else { DEFAULT_QPS };
        let burst = f64::from(burst.max(1));
        Self { qps, burst, bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }

    fn reserve(&self) -> Duration {
        let mut b = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let refill = now.saturating_duration_since(b.last).as_secs_f64() * self.qps;
        b.tokens = (b.tokens + refill).min(self.burst) - 1.0;
        b.last = now;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-b.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }
}

impl Default for BucketRateLimiter {
    fn default() -> Self { Self::new(DEFAULT_QPS, DEFAULT_BURST) }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration { self.reserve() }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 { 0 }
}

/// Waits for the slowest of its limiters. Every limiter records every failure.
pub struct MaxOf<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOf<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self { Self { limiters } }
}

impl<K> RateLimiter<K> for MaxOf<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters.iter().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for l in &self.limiters {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Per-key backoff between `base` and `max`, never faster than the default bucket allows overall.
pub fn controller_rate_limiter<K>(base: Duration, max: Duration) -> MaxOf<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    let limiters: Vec<Box<dyn RateLimiter<K>>> =
        vec![Box::new(ItemExponentialBackoff::new(base, max)), Box::new(BucketRateLimiter::default())];
    MaxOf::new(limiters)
}

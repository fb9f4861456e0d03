//! Retry Rate Limiting
//!
//! Decides how long a failed item waits before it is retried. Two limiters
//! are combined and the longer delay wins:
//!
//! - per item: exponential backoff, `base * 2^failures`, capped at `max`
//! - global: a token bucket capping aggregate retry throughput
//!
//! # Token Bucket
//!
//! Tokens refill at `qps` per second up to `burst`. Each retry reserves one
//! token; once the bucket is empty, reservations are scheduled at the time
//! their token will have refilled, so a burst of failures is spread out
//! rather than rejected.

use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::ReconcileConfig;

/// Delay policy for re-enqueued items
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `item` may be retried; records one more failure
    fn when(&self, item: &K) -> Duration;

    /// Clear the item's failure history
    fn forget(&self, item: &K);

    /// Failures recorded for the item since it was last forgotten
    fn retries(&self, item: &K) -> u32;
}

// =============================================================================
// Per-Item Exponential Backoff
// =============================================================================

#[derive(Debug)]
pub struct ItemExponentialBackoff<K: Eq + Hash> {
    base: Duration,
    max: Duration,
    failures: DashMap<K, u32>,
}

impl<K: Eq + Hash> ItemExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: DashMap::new(),
        }
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1u128.checked_shl(failures).unwrap_or(u128::MAX);
        let nanos = self.base.as_nanos().saturating_mul(factor);
        if nanos >= self.max.as_nanos() {
            self.max
        } else {
            // below max, so it fits in u64
            Duration::from_nanos(nanos as u64)
        }
    }
}

impl<K> RateLimiter<K> for ItemExponentialBackoff<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    fn when(&self, item: &K) -> Duration {
        let failures = {
            let mut entry = self.failures.entry(item.clone()).or_insert(0);
            let previous = *entry;
            *entry = previous.saturating_add(1);
            previous
        };
        self.delay_for(failures)
    }

    fn forget(&self, item: &K) {
        self.failures.remove(item);
    }

    fn retries(&self, item: &K) -> u32 {
        self.failures.get(item).map(|f| *f).unwrap_or(0)
    }
}

// =============================================================================
// Global Token Bucket
// =============================================================================

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Starts full; a non-positive `qps` disables limiting
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Reserve one token, returning how long until it is available
    pub fn reserve(&self) -> Duration {
        if !(self.qps.is_finite() && self.qps > 0.0) {
            return Duration::ZERO;
        }

        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.qps).min(self.burst);
        bucket.last_refill = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            // a tiny qps can push the wait past what Duration holds
            Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        self.reserve()
    }

    fn forget(&self, _item: &K) {}

    fn retries(&self, _item: &K) -> u32 {
        0
    }
}

// =============================================================================
// Composition
// =============================================================================

/// Longest delay of all inner limiters
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn retries(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.retries(item))
            .max()
            .unwrap_or(0)
    }
}

/// Item backoff combined with the global bucket, as configured
pub fn default_rate_limiter<K>(config: &ReconcileConfig) -> MaxOfRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialBackoff::new(
            config.base_delay(),
            config.max_delay(),
        )),
        Box::new(BucketRateLimiter::new(config.retry_qps, config.retry_burst)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::reconcile::queue::WorkQueue;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let limiter =
            ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_millis(100));
        let delays: Vec<_> = (0..7).map(|_| limiter.when(&"item")).collect();
        assert_eq!(
            delays,
            [5, 10, 20, 40, 80, 100, 100].map(Duration::from_millis).to_vec()
        );
        assert_eq!(limiter.retries(&"item"), 7);
    }

    #[test]
    fn test_backoff_is_per_item() {
        let limiter = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        limiter.when(&"a");
        limiter.when(&"a");
        assert_eq!(limiter.when(&"b"), Duration::from_millis(5));
        assert_eq!(limiter.retries(&"a"), 2);
    }

    #[test]
    fn test_forget_resets_backoff() {
        let limiter = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        limiter.when(&"a");
        limiter.when(&"a");
        limiter.forget(&"a");
        assert_eq!(limiter.retries(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
    }

    #[test]
    fn test_huge_failure_count_saturates() {
        let limiter: ItemExponentialBackoff<&str> = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));
        assert_eq!(limiter.delay_for(200), Duration::from_secs(1000));
        assert_eq!(limiter.delay_for(u32::MAX), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_spreads_out_after_burst() {
        let bucket = BucketRateLimiter::new(10.0, 2);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::from_millis(100));
        assert_eq!(bucket.reserve(), Duration::from_millis(200));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(bucket.reserve(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanishing_qps_saturates_delay() {
        let bucket = BucketRateLimiter::new(1e-320, 1);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_delay_parks_retry_until_shutdown() {
        let queue = Arc::new(WorkQueue::new(BucketRateLimiter::new(1e-320, 1)));
        queue.add_rate_limited("a");
        queue.add_rate_limited("b");
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(queue.is_empty());
        queue.shut_down();
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_of_takes_longest() {
        let limiter: MaxOfRateLimiter<&str> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialBackoff::new(
                Duration::from_millis(1),
                Duration::from_secs(1),
            )),
            Box::new(BucketRateLimiter::new(1.0, 1)),
        ]);

        assert_eq!(limiter.when(&"a"), Duration::from_millis(1));
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1));
        assert_eq!(limiter.retries(&"a"), 2);

        limiter.forget(&"a");
        assert_eq!(limiter.retries(&"a"), 0);
    }
}

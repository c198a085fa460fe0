//! Token-bucket gate for outbound exchange calls.
//!
//! Continuous refill: `tokens = min(capacity, tokens + rate * dt)` on every
//! check. Two buckets are kept per endpoint class — a short burst bucket and
//! a sustained one — and the more restrictive governs.

use parking_lot::Mutex;
use tokio::time::{sleep, Duration, Instant};

struct BucketState {
    tokens: f64,
    last_update: Instant,
}

pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `rate` tokens per second sustained, `capacity` tokens of burst.
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_update: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + self.rate * elapsed).min(self.capacity);
        state.last_update = now;
    }

    /// Wait until `cost` tokens are available, then consume them. The lock
    /// is only held for the arithmetic, never across the sleep.
    pub async fn acquire(&self, cost: f64) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state, Instant::now());
                if state.tokens >= cost {
                    state.tokens -= cost;
                    return;
                }
                let deficit = cost - state.tokens;
                Duration::from_secs_f64(deficit / self.rate)
            };
            sleep(wait).await;
        }
    }

    /// Non-blocking variant.
    pub fn try_acquire(&self, cost: f64) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        if state.tokens >= cost {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Return tokens, e.g. when the paired bucket could not pay.
    fn refund(&self, cost: f64) {
        let mut state = self.state.lock();
        state.tokens = (state.tokens + cost).min(self.capacity);
    }

    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }
}

/// Burst-short plus sustained-long buckets; every outbound call pays both.
pub struct DualRateLimiter {
    burst: TokenBucket,
    sustained: TokenBucket,
}

impl DualRateLimiter {
    pub fn new(burst_rate: f64, burst_capacity: f64, sustained_rate: f64, sustained_capacity: f64) -> Self {
        Self {
            burst: TokenBucket::new(burst_rate, burst_capacity),
            sustained: TokenBucket::new(sustained_rate, sustained_capacity),
        }
    }

    pub async fn acquire(&self, cost: f64) {
        self.burst.acquire(cost).await;
        self.sustained.acquire(cost).await;
    }

    pub fn try_acquire(&self, cost: f64) -> bool {
        if !self.burst.try_acquire(cost) {
            return false;
        }
        if !self.sustained.try_acquire(cost) {
            self.burst.refund(cost);
            return false;
        }
        true
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_throttle() {
        let bucket = TokenBucket::new(10.0, 5.0);

        // Full burst is available immediately.
        for _ in 0..5 {
            assert!(bucket.try_acquire(1.0));
        }
        assert!(!bucket.try_acquire(1.0));

        // One token refills after 100ms at 10/s.
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(bucket.try_acquire(1.0));
        assert!(!bucket.try_acquire(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_capacity() {
        let bucket = TokenBucket::new(10.0, 5.0);
        assert!(bucket.try_acquire(5.0));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!((bucket.available() - 5.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let bucket = TokenBucket::new(10.0, 1.0);
        bucket.acquire(1.0).await;

        let start = Instant::now();
        bucket.acquire(1.0).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(90), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dual_limiter_most_restrictive_governs() {
        // Burst allows 5 instantly, sustained only 2.
        let limiter = DualRateLimiter::new(100.0, 5.0, 1.0, 2.0);
        assert!(limiter.try_acquire(1.0));
        assert!(limiter.try_acquire(1.0));
        assert!(!limiter.try_acquire(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dual_limiter_refunds_burst_on_sustained_miss() {
        let limiter = DualRateLimiter::new(0.001, 1.0, 0.001, 0.0);
        // Sustained bucket is empty: burst token must be returned.
        assert!(!limiter.try_acquire(1.0));
        assert!((limiter.burst.available() - 1.0).abs() < 1e-9);
    }
}

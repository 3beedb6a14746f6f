// Request admission control using a token bucket
//
// Design:
// - Token bucket algorithm: fixed refill rate, configurable burst capacity
// - Zero QPS is an explicit unlimited limiter, not a missing one
// - One bucket behind a mutex: share via Arc for an aggregate cap across
//   workers, or give each worker its own limiter for a per-role cap
// - Waiting is cancellable: a worker parked on an empty bucket still sees
//   its stop request
//
// Performance: uncontended acquire is one mutex lock plus a refill computation

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Burst capacity used when the configuration does not override it
pub const DEFAULT_BURST: u32 = 100;

/// Returned by [`RateLimiter::acquire`] when the wait was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("token acquisition cancelled")]
pub struct Cancelled;

/// Token bucket with smooth refill
///
/// - Tokens refill at a constant rate (tokens per second)
/// - Burst capacity = max tokens
/// - Each request consumes one token
///
/// The bucket takes the current instant as an argument so tests can drive it
/// with a simulated clock.
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum tokens (burst capacity)
    capacity: f64,

    /// Current available tokens (float for smooth refill)
    tokens: f64,

    /// Tokens added per second
    refill_rate: f64,

    /// Last time tokens were refilled
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket refilling at `rate` tokens per second.
    ///
    /// Initially full. `rate` and `burst` are clamped to at least one.
    pub fn new(rate: u64, burst: u32, now: Instant) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_rate: rate.max(1) as f64,
            last_refill: now,
        }
    }

    /// Try to consume one token at `now`.
    ///
    /// On failure returns how long until the next token becomes available.
    pub fn try_consume_at(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_rate))
        }
    }

    /// Tokens = min(capacity, current_tokens + (elapsed_seconds * refill_rate))
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();

        if elapsed > 0.0 {
            let new_tokens = self.tokens + (elapsed * self.refill_rate);
            self.tokens = new_tokens.min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Current token count (for observability)
    pub fn available_at(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    pub fn rate(&self) -> f64 {
        self.refill_rate
    }
}

/// Rate limiter gating benchmark requests
///
/// # Example
/// ```ignore
/// let limiter = RateLimiter::new(15_000, DEFAULT_BURST);
/// let stop = CancellationToken::new();
/// limiter.acquire(&stop).await?;
/// // issue one request
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    /// `None` means unlimited
    bucket: Option<Mutex<TokenBucket>>,
}

impl RateLimiter {
    /// Limiter admitting `qps` requests per second with the given burst.
    ///
    /// A `qps` of zero yields an unlimited limiter.
    pub fn new(qps: u64, burst: u32) -> Self {
        if qps == 0 {
            return Self::unlimited();
        }
        Self {
            bucket: Some(Mutex::new(TokenBucket::new(qps, burst, Instant::now()))),
        }
    }

    /// Limiter that never delays a caller
    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bucket.is_none()
    }

    /// Configured rate, `None` when unlimited
    pub fn rate(&self) -> Option<f64> {
        self.bucket.as_ref().map(|bucket| bucket.lock().rate())
    }

    /// Take one token without waiting.
    pub fn try_acquire(&self) -> bool {
        match &self.bucket {
            None => true,
            Some(bucket) => bucket.lock().try_consume_at(Instant::now()).is_ok(),
        }
    }

    /// Wait for one token.
    ///
    /// Returns `Err(Cancelled)` as soon as `cancel` fires, whether the caller
    /// is parked on an empty bucket or the token was already cancelled on
    /// entry. An unlimited limiter returns immediately.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let Some(bucket) = &self.bucket else {
            return Ok(());
        };

        loop {
            // Lock is released before sleeping
            let wait = match bucket.lock().try_consume_at(Instant::now()) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Current available tokens, `None` when unlimited
    pub fn available_tokens(&self) -> Option<f64> {
        self.bucket
            .as_ref()
            .map(|bucket| bucket.lock().available_at(Instant::now()))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_token_bucket_basic() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(10, 10, now);

        // Initially full: 10 requests succeed
        for _ in 0..10 {
            assert!(bucket.try_consume_at(now).is_ok());
        }

        // 11th request fails (bucket empty)
        assert!(bucket.try_consume_at(now).is_err());
    }

    #[test]
    fn test_token_bucket_refill() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(10, 10, start);

        for _ in 0..10 {
            assert!(bucket.try_consume_at(start).is_ok());
        }
        assert!(bucket.try_consume_at(start).is_err());

        // 200ms at 10 QPS refills exactly 2 tokens
        let later = start + Duration::from_millis(200);
        assert!(bucket.try_consume_at(later).is_ok());
        assert!(bucket.try_consume_at(later).is_ok());
        assert!(bucket.try_consume_at(later).is_err());
    }

    #[test]
    fn test_wait_hint_matches_refill_rate() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(100, 1, now);
        assert!(bucket.try_consume_at(now).is_ok());

        let wait = bucket.try_consume_at(now).unwrap_err();
        assert!(
            (Duration::from_millis(9)..=Duration::from_millis(11)).contains(&wait),
            "expected ~10ms wait, got {:?}",
            wait
        );
    }

    #[test]
    fn test_token_bucket_capped_at_burst() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1000, 100, start);

        // Two idle seconds would refill 2000 tokens without the cap
        let later = start + Duration::from_secs(2);
        assert_eq!(bucket.available_at(later), 100.0);
    }

    #[test]
    fn test_zero_burst_clamped() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(10, 0, now);
        assert_eq!(bucket.capacity(), 1);
        assert!(bucket.try_consume_at(now).is_ok());
    }

    #[test]
    fn test_zero_qps_is_unlimited() {
        let limiter = RateLimiter::new(0, DEFAULT_BURST);
        assert!(limiter.is_unlimited());
        assert!(limiter.rate().is_none());
        assert!(limiter.available_tokens().is_none());
        for _ in 0..10_000 {
            assert!(limiter.try_acquire());
        }
    }

    #[tokio::test]
    async fn test_unlimited_acquire_never_blocks() {
        let limiter = RateLimiter::unlimited();
        let cancel = CancellationToken::new();
        for _ in 0..10_000 {
            limiter.acquire(&cancel).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_acquire_on_cancelled_token() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(RateLimiter::unlimited().acquire(&cancel).await, Err(Cancelled));
        assert_eq!(RateLimiter::new(10, 10).acquire(&cancel).await, Err(Cancelled));
    }

    #[tokio::test]
    async fn test_blocked_acquire_wakes_on_cancel() {
        // One token per second: the second acquire parks until cancelled
        let limiter = Arc::new(RateLimiter::new(1, 1));
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire should return promptly after cancel")
            .unwrap();
        assert_eq!(result, Err(Cancelled));
    }

    #[tokio::test]
    async fn test_acquire_paces_requests() {
        let limiter = RateLimiter::new(200, 1);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        for _ in 0..21 {
            limiter.acquire(&cancel).await.unwrap();
        }
        // First token is free, the next 20 take ~100ms at 200 QPS
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(90),
            "expected pacing, finished in {:?}",
            elapsed
        );
    }

    #[test]
    fn test_shared_limiter_caps_aggregate() {
        // Long refill period so only the burst is available during the test
        let limiter = Arc::new(RateLimiter::new(1, 50));
        let mut handles = vec![];

        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            handles.push(thread::spawn(move || {
                (0..10).filter(|_| limiter.try_acquire()).count()
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(
            (50..=51).contains(&total),
            "Expected ~50 requests, got {}",
            total
        );
    }

    #[test]
    fn test_independent_limiters_do_not_share_tokens() {
        let a = RateLimiter::new(1, 5);
        let b = RateLimiter::new(1, 5);

        assert_eq!((0..10).filter(|_| a.try_acquire()).count(), 5);
        assert_eq!((0..10).filter(|_| b.try_acquire()).count(), 5);
    }

    proptest! {
        // Simulated clock: in every window of length T the bucket grants at most R*T + B tokens
        #[test]
        fn prop_grants_bounded_in_every_window(
            rate in 1u64..500,
            burst in 1u32..200,
            steps in prop::collection::vec((0u64..50, 1usize..20), 1..200),
            window_ms in 1u64..2_000,
        ) {
            let origin = Instant::now();
            let mut bucket = TokenBucket::new(rate, burst, origin);
            let mut clock_ms = 0u64;
            let mut grants: Vec<u64> = Vec::new();

            for (advance_ms, attempts) in steps {
                clock_ms += advance_ms;
                let now = origin + Duration::from_millis(clock_ms);
                for _ in 0..attempts {
                    if bucket.try_consume_at(now).is_ok() {
                        grants.push(clock_ms);
                    }
                }
            }

            let bound = rate as f64 * (window_ms as f64 / 1000.0) + burst as f64;
            for (i, start) in grants.iter().enumerate() {
                let in_window = grants[i..]
                    .iter()
                    .take_while(|t| **t <= start + window_ms)
                    .count();
                prop_assert!(
                    in_window as f64 <= bound + 1e-6,
                    "{} grants in {}ms window exceeds bound {}",
                    in_window,
                    window_ms,
                    bound
                );
            }
        }
    }
}

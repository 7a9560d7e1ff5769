//! Request rate limiting using a token bucket
//!
//! The [`RequestLimiter`] bounds how many sub-unit fetches a pipeline issues
//! per second, regardless of how many workers share it. All workers of one
//! unit pipeline draw from the same bucket, so throughput stays fixed while
//! worker count only controls parallelism.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Token-bucket limiter counted in requests
///
/// - Tokens represent requests that may be issued now
/// - Tokens refill at a constant rate (`rate` per second)
/// - Bucket capacity equals `rate`, so the burst matches the refill rate
/// - Workers acquire one token before each fetch; with no tokens available
///   they wait for the next refill
///
/// Uses `AtomicU64` for lock-free token tracking; a rate of 0 means
/// unlimited.
#[derive(Clone)]
pub struct RequestLimiter {
    /// Requests per second (0 = unlimited); also the bucket capacity
    rate: Arc<AtomicU64>,
    /// Available tokens
    tokens: Arc<AtomicU64>,
    /// Last refill timestamp (nanoseconds since an arbitrary epoch)
    last_refill: Arc<AtomicU64>,
}

impl RequestLimiter {
    /// Create a limiter allowing `rate` requests per second, with a burst of
    /// the same size. `None` disables limiting.
    #[must_use]
    pub fn new(rate: Option<u64>) -> Self {
        let rate = rate.unwrap_or(0);
        Self {
            rate: Arc::new(AtomicU64::new(rate)),
            tokens: Arc::new(AtomicU64::new(rate)),
            last_refill: Arc::new(AtomicU64::new(Self::now_nanos())),
        }
    }

    /// The configured rate, or `None` when unlimited
    pub fn rate(&self) -> Option<u64> {
        match self.rate.load(Ordering::Relaxed) {
            0 => None,
            r => Some(r),
        }
    }

    /// Acquire permission to issue one request.
    ///
    /// Waits until a token is available. Returns immediately when unlimited.
    pub async fn acquire(&self) {
        loop {
            let rate = self.rate.load(Ordering::Relaxed);
            if rate == 0 {
                return;
            }

            self.refill_tokens();

            let current = self.tokens.load(Ordering::SeqCst);
            if current > 0 {
                if self
                    .tokens
                    .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return;
                }
                // CAS lost to a sibling worker — retry immediately
                continue;
            }

            // No tokens — sleep roughly one token's worth, capped so the
            // limiter stays responsive at very low rates
            let wait_ms = (1000.0 / rate as f64) as u64;
            tokio::time::sleep(Duration::from_millis(wait_ms.clamp(10, 250))).await;
        }
    }

    /// Refill tokens based on elapsed time since the last refill
    fn refill_tokens(&self) {
        let rate = self.rate.load(Ordering::Relaxed);
        if rate == 0 {
            return;
        }

        let now = Self::now_nanos();
        let last = self.last_refill.load(Ordering::SeqCst);

        let elapsed_secs = now.saturating_sub(last) as f64 / 1_000_000_000.0;
        let tokens_to_add = (rate as f64 * elapsed_secs) as u64;

        if tokens_to_add > 0
            && self
                .last_refill
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            // Cap at the bucket capacity
            let current = self.tokens.load(Ordering::SeqCst);
            self.tokens
                .store((current + tokens_to_add).min(rate), Ordering::SeqCst);
        }
    }

    /// Monotonic time in nanoseconds (arbitrary but stable epoch)
    fn now_nanos() -> u64 {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_acquire_returns_immediately() {
        let limiter = RequestLimiter::new(None);

        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert!(
            start.elapsed() < Duration::from_millis(10),
            "unlimited limiter must not throttle"
        );
    }

    #[tokio::test]
    async fn burst_allows_rate_many_immediate_acquires() {
        let limiter = RequestLimiter::new(Some(5));

        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(
            start.elapsed() < Duration::from_millis(50),
            "the initial burst should cover `rate` acquisitions"
        );
    }

    #[tokio::test]
    async fn sixth_acquire_waits_for_a_refill() {
        let limiter = RequestLimiter::new(Some(5));
        for _ in 0..5 {
            limiter.acquire().await;
        }

        let start = Instant::now();
        limiter.acquire().await;
        assert!(
            start.elapsed() >= Duration::from_millis(100),
            "an empty bucket at 5/s should take ~200ms to yield a token, took {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn rate_reports_none_for_unlimited() {
        assert_eq!(RequestLimiter::new(None).rate(), None);
        assert_eq!(RequestLimiter::new(Some(3)).rate(), Some(3));
    }

    #[tokio::test]
    async fn shared_bucket_bounds_total_throughput() {
        use std::sync::atomic::AtomicUsize;

        let limiter = RequestLimiter::new(Some(4));
        let acquired = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                let acquired = Arc::clone(&acquired);
                tokio::spawn(async move {
                    for _ in 0..3 {
                        limiter.acquire().await;
                        acquired.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        // After ~250ms, at most burst (4) + refill (~1) should have passed
        tokio::time::sleep(Duration::from_millis(250)).await;
        let so_far = acquired.load(Ordering::SeqCst);
        assert!(
            so_far <= 6,
            "12 acquisitions at 4/s cannot mostly complete in 250ms, got {so_far}"
        );

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(acquired.load(Ordering::SeqCst), 12);
    }
}

//! Token bucket rate limiting for push destinations.
//!
//! Refill is lazy: tokens are recomputed from elapsed time whenever the bucket
//! is consulted, never by a background timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::RateLimiterConfig;
use crate::{Error, Result};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Allowed and denied counts since creation or the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub allowed: u64,
    pub denied: u64,
}

impl RateLimiterStats {
    /// Share of denied requests, in percent.
    pub fn drop_rate_percent(&self) -> f64 {
        let total = self.allowed + self.denied;
        if total == 0 {
            0.0
        } else {
            self.denied as f64 * 100.0 / total as f64
        }
    }
}

/// Token bucket with a burst capacity and a refill rate per interval.
///
/// The token count always stays within `[0, max_tokens]`.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    max_tokens: f64,
    refill_rate: f64,
    interval: Duration,
    allowed: AtomicU64,
    denied: AtomicU64,
    reset_notify: Notify,
}

impl RateLimiter {
    /// Create a limiter holding `max_tokens`, adding `refill_rate` tokens per
    /// `interval`. The bucket starts full.
    pub fn new(max_tokens: u32, refill_rate: u32, interval: Duration) -> Self {
        let max_tokens = f64::from(max_tokens.max(1));
        Self {
            bucket: Mutex::new(Bucket {
                tokens: max_tokens,
                last_refill: Instant::now(),
            }),
            max_tokens,
            refill_rate: f64::from(refill_rate.max(1)),
            interval: if interval.is_zero() {
                RateLimiterConfig::INTERVAL
            } else {
                interval
            },
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            reset_notify: Notify::new(),
        }
    }

    /// Limiter for `requests_per_minute` with a burst of `burst_size`.
    pub fn from_config(config: &RateLimiterConfig) -> Self {
        Self::new(
            config.burst_size,
            config.requests_per_minute,
            RateLimiterConfig::INTERVAL,
        )
    }

    /// Take a token if one is available.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub(crate) fn allow_at(&self, now: Instant) -> bool {
        let allowed = {
            let mut bucket = self.bucket.lock();
            self.refill(&mut bucket, now);
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                true
            } else {
                false
            }
        };

        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            trace!("Rate limited, no tokens available");
        }
        allowed
    }

    /// Wait until a token is available and take it.
    ///
    /// Sleeps until the bucket is expected to hold a whole token, and wakes
    /// early on [`Self::reset`]. Returns [`Error::Cancelled`] if the token
    /// fires first.
    pub async fn wait_until_allowed(&self, token: &CancellationToken) -> Result<()> {
        loop {
            let notified = self.reset_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket, Instant::now());
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(self.time_until_token(bucket.tokens))
                }
            };
            let Some(wait) = wait else {
                self.allowed.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            };

            debug!(wait = ?wait, "Rate limited, waiting for next token");
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(wait) => {}
                _ = &mut notified => {}
            }
        }
    }

    /// Refill the bucket and drop the counters.
    pub fn reset(&self) {
        {
            let mut bucket = self.bucket.lock();
            bucket.tokens = self.max_tokens;
            bucket.last_refill = Instant::now();
        }
        self.allowed.store(0, Ordering::Relaxed);
        self.denied.store(0, Ordering::Relaxed);
        self.reset_notify.notify_waiters();
    }

    /// Tokens currently available, after refill.
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens as u32
    }

    /// Tokens added per interval.
    pub fn refill_rate(&self) -> u32 {
        self.refill_rate as u32
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
        }
    }

    fn time_until_token(&self, tokens: f64) -> Duration {
        let needed = (1.0 - tokens).max(0.0);
        let secs = needed / self.refill_rate * self.interval.as_secs_f64();
        Duration::from_secs_f64(secs).max(Duration::from_millis(1))
    }

    /// Whole intervals add `periods * rate` tokens; a partial interval adds a
    /// proportional amount. Either way the result is clamped to capacity.
    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let added = if elapsed >= self.interval {
            let periods = (elapsed.as_nanos() / self.interval.as_nanos()) as f64;
            periods * self.refill_rate
        } else {
            self.refill_rate * (elapsed.as_secs_f64() / self.interval.as_secs_f64())
        };

        if added > 0.0 {
            bucket.tokens = (bucket.tokens + added).min(self.max_tokens);
            bucket.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn limiter(burst: u32, rate: u32) -> RateLimiter {
        RateLimiter::new(burst, rate, Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_deny() {
        let rl = limiter(5, 10);
        let now = Instant::now();
        for _ in 0..5 {
            assert!(rl.allow_at(now));
        }
        assert!(!rl.allow_at(now));
        assert_eq!(rl.stats(), RateLimiterStats { allowed: 5, denied: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_interval_refills_rate_tokens() {
        let rl = limiter(10, 4);
        let start = Instant::now();
        for _ in 0..10 {
            assert!(rl.allow_at(start));
        }
        assert!(!rl.allow_at(start));

        let later = start + Duration::from_secs(60);
        let mut granted = 0;
        while rl.allow_at(later) {
            granted += 1;
        }
        assert_eq!(granted, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fractional_refill() {
        let rl = limiter(2, 60);
        let start = Instant::now();
        assert!(rl.allow_at(start));
        assert!(rl.allow_at(start));
        assert!(!rl.allow_at(start));

        // 60 per minute is one token per second.
        assert!(!rl.allow_at(start + Duration::from_millis(500)));
        assert!(rl.allow_at(start + Duration::from_millis(1500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let rl = limiter(3, 100);
        let start = Instant::now();
        rl.allow_at(start);
        let later = start + Duration::from_secs(600);
        let mut granted = 0;
        while rl.allow_at(later) {
            granted += 1;
        }
        assert_eq!(granted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_allowed_sleeps_for_next_token() {
        let rl = limiter(1, 60);
        assert!(rl.allow());

        let token = CancellationToken::new();
        let start = Instant::now();
        rl.wait_until_allowed(&token).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1), "waited {waited:?}");
        assert!(waited < Duration::from_secs(2), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_allowed_is_cancellable() {
        let rl = Arc::new(limiter(1, 1));
        assert!(rl.allow());

        let token = CancellationToken::new();
        let waiter = {
            let rl = rl.clone();
            let token = token.clone();
            tokio::spawn(async move { rl.wait_until_allowed(&token).await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_wakes_waiters() {
        let rl = Arc::new(limiter(1, 1));
        assert!(rl.allow());

        let token = CancellationToken::new();
        let waiter = {
            let rl = rl.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                rl.wait_until_allowed(&token).await.map(|_| start.elapsed())
            })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        rl.reset();
        let waited = waiter.await.unwrap().unwrap();
        assert!(waited < Duration::from_secs(60));
    }

    #[test]
    fn test_drop_rate() {
        let stats = RateLimiterStats {
            allowed: 1,
            denied: 3,
        };
        assert_eq!(stats.drop_rate_percent(), 75.0);
        assert_eq!(RateLimiterStats::default().drop_rate_percent(), 0.0);
    }
}

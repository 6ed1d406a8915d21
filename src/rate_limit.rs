// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

// Upper bound on the wait for a single oversized request.
const MAX_SINGLE_WAIT: Duration = Duration::from_secs(30);

struct Bucket {
    last_refill: Instant,
    tokens: f64,
    bytes_per_sec: f64,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.bytes_per_sec)
            .min(self.bytes_per_sec);
    }
}

/// Byte-rate limiter shared by every session of a transfer.
/// A rate of 0 means unlimited and skips the lock entirely.
pub struct RateLimiter {
    unlimited: AtomicBool,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec as f64;
        Self {
            unlimited: AtomicBool::new(bytes_per_sec == 0),
            bucket: Mutex::new(Bucket {
                last_refill: Instant::now(),
                tokens: rate,
                bytes_per_sec: rate,
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn rate(&self) -> u64 {
        if self.unlimited.load(Ordering::Relaxed) {
            return 0;
        }
        self.lock().bytes_per_sec as u64
    }

    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.lock();
        bucket.bytes_per_sec = bytes_per_sec as f64;
        bucket.tokens = bytes_per_sec as f64;
        bucket.last_refill = Instant::now();
        self.unlimited.store(bytes_per_sec == 0, Ordering::Relaxed);
    }

    /// Waits until `bytes` may pass.
    pub async fn acquire(&self, bytes: usize) {
        if bytes == 0 || self.unlimited.load(Ordering::Relaxed) {
            return;
        }
        let wanted = bytes as f64;

        loop {
            let (wait, settled) = {
                let mut bucket = self.lock();
                if bucket.bytes_per_sec <= 0.0 {
                    return;
                }
                bucket.refill();

                if bucket.tokens >= wanted {
                    bucket.tokens -= wanted;
                    return;
                }
                if wanted > bucket.bytes_per_sec {
                    // Can never fit in the bucket: go into debt and pay it off.
                    bucket.tokens -= wanted;
                    let debt = Duration::from_secs_f64(wanted / bucket.bytes_per_sec);
                    (debt.min(MAX_SINGLE_WAIT), true)
                } else {
                    let missing = wanted - bucket.tokens;
                    let wait = Duration::from_secs_f64((missing / bucket.bytes_per_sec).max(0.001));
                    (wait, false)
                }
            };

            tokio::time::sleep(wait).await;
            if settled {
                return;
            }
        }
    }

    #[cfg(test)]
    fn tokens(&self) -> f64 {
        let mut bucket = self.lock();
        bucket.refill();
        bucket.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TOLERANCE: f64 = 1e-3;

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        limiter.acquire(10_000_000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.rate(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_when_budget_available() {
        let limiter = RateLimiter::new(1000);
        let start = Instant::now();
        limiter.acquire(400).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!((limiter.tokens() - 600.0).abs() < TOLERANCE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_refill() {
        let limiter = RateLimiter::new(1000);
        limiter.acquire(1000).await;

        let start = Instant::now();
        limiter.acquire(500).await;
        let waited = start.elapsed();
        assert!(
            waited >= Duration::from_millis(490) && waited <= Duration::from_millis(600),
            "waited {:?}",
            waited
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_pays_proportionally() {
        let limiter = RateLimiter::new(1000);
        let start = Instant::now();
        limiter.acquire(3000).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(3), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_consumers_share_budget() {
        let limiter = Arc::new(RateLimiter::new(1000));
        limiter.acquire(1000).await;

        let start = Instant::now();
        let a = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(500).await })
        };
        let b = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(1000).await })
        };
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra.is_ok() && rb.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(1400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rate_to_zero_unthrottles() {
        let limiter = RateLimiter::new(10);
        limiter.set_rate(0);
        let start = Instant::now();
        limiter.acquire(1_000_000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}

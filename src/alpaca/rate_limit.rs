// =============================================================================
// Rate Limiter — shared leaky bucket gating all outbound broker calls
// =============================================================================
//
// Tokens drip in continuously at `per_minute / 60` per second up to a burst
// ceiling of one minute's budget. `acquire` suspends the caller until a
// token is available; contention between tasks is expected and harmless.
// =============================================================================

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

struct Bucket {
    available: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    /// Create a limiter allowing `per_minute` requests per minute.
    pub fn new(per_minute: u32) -> Self {
        let capacity = per_minute.max(1) as f64;
        Self {
            bucket: Mutex::new(Bucket {
                available: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_per_sec: capacity / 60.0,
        }
    }

    /// Take one token, suspending until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.available =
                    (bucket.available + elapsed * self.refill_per_sec).min(self.capacity);
                bucket.last_refill = Instant::now();

                if bucket.available >= 1.0 {
                    bucket.available -= 1.0;
                    return;
                }
                let deficit = 1.0 - bucket.available;
                Duration::from_secs_f64(deficit / self.refill_per_sec)
            };

            debug!(wait_ms = wait.as_millis() as u64, "rate limiter saturated — waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("refill_per_sec", &self.refill_per_sec)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_up_to_capacity_is_immediate() {
        let limiter = RateLimiter::new(60);
        let start = std::time::Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_waits_for_refill() {
        let limiter = RateLimiter::new(60); // one token per second
        for _ in 0..60 {
            limiter.acquire().await;
        }
        let start = Instant::now();
        limiter.acquire().await;
        // The 61st acquire needs roughly a full second of refill.
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}

//! Process-wide token bucket guarding the matching provider's
//! requests-per-minute budget. Tokens refill continuously; `acquire` waits
//! until one is available instead of failing.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `rate` requests per `period`.
    pub fn new(rate: u32, period: Duration) -> Self {
        let capacity = f64::from(rate.max(1));
        Self {
            capacity,
            refill_per_sec: capacity / period.as_secs_f64(),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_within_capacity_is_immediate() {
        let bucket = TokenBucket::new(5, Duration::from_secs(60));
        let started = Instant::now();
        for _ in 0..5 {
            bucket.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_waits_for_refill() {
        let bucket = TokenBucket::new(2, Duration::from_secs(2));
        bucket.acquire().await;
        bucket.acquire().await;
        let before = Instant::now();
        bucket.acquire().await;
        // One token refills per second; the paused clock auto-advances.
        assert!(before.elapsed() >= Duration::from_millis(900));
    }
}

//! Token-bucket rate limiting shared across workers. One bucket gates calls
//! to the mailbox adapter, a separate bucket gates calls to the classifier,
//! so a burst of mailbox fetches can't starve model throughput and
//! vice versa.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;

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
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: capacity.max(1) as f64,
            refill_per_sec: refill_per_sec.max(1) as f64,
            state: Mutex::new(BucketState {
                tokens: capacity.max(1) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Block until one token is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = Instant::now();

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
                }
            };

            match wait {
                Some(duration) => sleep(duration).await,
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_up_to_capacity_does_not_block() {
        let bucket = TokenBucket::new(3, 1);
        let start = Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        bucket.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn exceeding_capacity_waits_for_refill() {
        let bucket = TokenBucket::new(1, 20);
        bucket.acquire().await;
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}

//! Token-bucket pacing for the LLM endpoint.
//!
//! Two buckets, both must clear before a request goes out: one counts
//! requests per minute, the other estimated prompt tokens per minute.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;

struct Bucket {
    capacity: f64,
    available: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(per_minute: u32, now: Instant) -> Self {
        let capacity = per_minute as f64;
        Self {
            capacity,
            available: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.available = (self.available + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `amount` if available, otherwise return how long until it is.
    ///
    /// A burst larger than the whole bucket is capped at capacity, so it
    /// clears once the bucket is full instead of stalling forever.
    fn try_take(&mut self, amount: f64, now: Instant) -> Option<Duration> {
        self.refill(now);
        let amount = amount.min(self.capacity);
        if self.available >= amount {
            self.available -= amount;
            return None;
        }
        let needed = amount - self.available;
        Some(Duration::from_secs_f64(needed / self.refill_per_sec))
    }
}

pub struct RateLimiter {
    requests: Mutex<Bucket>,
    tokens: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, tokens_per_minute: u32) -> Self {
        let now = Instant::now();
        Self {
            requests: Mutex::new(Bucket::new(requests_per_minute.max(1), now)),
            tokens: Mutex::new(Bucket::new(tokens_per_minute.max(1), now)),
        }
    }

    /// Wait until one request of `estimated_tokens` may be sent.
    pub async fn acquire(&self, estimated_tokens: u32) {
        loop {
            let wait = {
                let mut requests = self.requests.lock().await;
                requests.try_take(1.0, Instant::now())
            };
            match wait {
                None => break,
                Some(wait) => sleep(wait).await,
            }
        }
        loop {
            let wait = {
                let mut tokens = self.tokens.lock().await;
                tokens.try_take(estimated_tokens as f64, Instant::now())
            };
            match wait {
                None => return,
                Some(wait) => sleep(wait).await,
            }
        }
    }
}

/// Rough token estimate for budget math; four characters per token is close
/// enough for pacing purposes.
pub fn estimate_tokens(text_len: usize) -> u32 {
    (text_len / 4).max(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_drains_and_reports_wait() {
        let start = Instant::now();
        let mut bucket = Bucket::new(60, start); // 1 per second

        for _ in 0..60 {
            assert_eq!(bucket.try_take(1.0, start), None);
        }
        let wait = bucket.try_take(1.0, start).expect("bucket exhausted");
        assert!(wait > Duration::from_millis(900) && wait <= Duration::from_secs(1));
    }

    #[test]
    fn bucket_refills_over_time() {
        let start = Instant::now();
        let mut bucket = Bucket::new(60, start);
        for _ in 0..60 {
            bucket.try_take(1.0, start);
        }
        // Two seconds later two tokens are back.
        let later = start + Duration::from_secs(2);
        assert_eq!(bucket.try_take(1.0, later), None);
        assert_eq!(bucket.try_take(1.0, later), None);
        assert!(bucket.try_take(1.0, later).is_some());
    }

    #[test]
    fn oversized_burst_is_capped_at_capacity() {
        let start = Instant::now();
        let mut bucket = Bucket::new(10, start);
        // Asking for more than the whole bucket still clears once full.
        assert_eq!(bucket.try_take(50.0, start), None);
        let wait = bucket.try_take(50.0, start).expect("empty");
        // Needs the full (capped) bucket back: 10 tokens at 1/6 s each.
        assert!(wait <= Duration::from_secs(61));
    }

    #[test]
    fn token_estimate_is_monotone() {
        assert_eq!(estimate_tokens(0), 1);
        assert!(estimate_tokens(4_000) < estimate_tokens(40_000));
    }
}

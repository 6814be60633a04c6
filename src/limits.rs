//! Token-bucket rate limiting for Kubernetes API writes
//!
//! Every write the controller issues (create, patch, status patch) passes
//! through one shared bucket so a reconcile storm cannot flood the API
//! server. Reads are not limited; the watch streams already bound them.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default sustained write rate in requests per second
pub const DEFAULT_WRITE_QPS: f64 = 20.0;

/// Default burst capacity in requests
pub const DEFAULT_WRITE_BURST: f64 = 40.0;

/// A token bucket: `qps` tokens refill per second up to `burst`.
///
/// [`RateLimiter::acquire`] waits until a token is available; callers are
/// served roughly in arrival order under contention because each waiter
/// sleeps only for the shortfall it observed.
pub struct RateLimiter {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a bucket with the given rate and burst, starting full
    pub fn new(qps: f64, burst: f64) -> Self {
        Self {
            qps,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Create a bucket with the controller's default write limits
    pub fn for_writes() -> Self {
        Self::new(DEFAULT_WRITE_QPS, DEFAULT_WRITE_BURST)
    }

    /// Take one token, waiting for refill when the bucket is empty
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("rate limiter lock poisoned");
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.qps)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

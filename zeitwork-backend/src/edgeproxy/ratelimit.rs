use moka::sync::Cache;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A single client's token bucket
#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Refill then try to take one token. Returns the updated bucket and
/// whether the request is allowed.
fn take_token(bucket: TokenBucket, rate: f64, burst: f64, now: Instant) -> (TokenBucket, bool) {
    let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
    let tokens = (bucket.tokens + elapsed * rate).min(burst);

    if tokens >= 1.0 {
        (
            TokenBucket {
                tokens: tokens - 1.0,
                last_refill: now,
            },
            true,
        )
    } else {
        (
            TokenBucket {
                tokens,
                last_refill: now,
            },
            false,
        )
    }
}

/// Per-client-IP token bucket limiter.
///
/// Buckets live in a TTL cache so idle clients cost nothing; an evicted
/// bucket simply starts full again.
pub struct RateLimiter {
    buckets: Cache<String, Arc<Mutex<TokenBucket>>>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        let rate = f64::from(requests_per_second.max(1));
        Self {
            buckets: Cache::builder()
                .max_capacity(100_000)
                .time_to_idle(Duration::from_secs(60))
                .build(),
            rate,
            // Allow short bursts of twice the sustained rate.
            burst: rate * 2.0,
        }
    }

    pub fn allow(&self, client_ip: &str) -> bool {
        let bucket = self.buckets.get_with(client_ip.to_string(), || {
            Arc::new(Mutex::new(TokenBucket {
                tokens: self.burst,
                last_refill: Instant::now(),
            }))
        });

        let Ok(mut bucket) = bucket.lock() else {
            return true;
        };
        let (updated, allowed) = take_token(*bucket, self.rate, self.burst, Instant::now());
        *bucket = updated;
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_bucket_allows_burst_then_blocks() {
        let now = Instant::now();
        let mut bucket = TokenBucket {
            tokens: 2.0,
            last_refill: now,
        };

        let (next, allowed) = take_token(bucket, 1.0, 2.0, now);
        assert!(allowed);
        bucket = next;
        let (next, allowed) = take_token(bucket, 1.0, 2.0, now);
        assert!(allowed);
        bucket = next;
        let (_, allowed) = take_token(bucket, 1.0, 2.0, now);
        assert!(!allowed, "burst spent, same-instant request must block");
    }

    #[test]
    fn test_tokens_refill_over_time() {
        let start = Instant::now();
        let bucket = TokenBucket {
            tokens: 0.0,
            last_refill: start,
        };

        let (_, allowed) = take_token(bucket, 10.0, 20.0, start + Duration::from_millis(150));
        assert!(allowed, "10 rps for 150ms refills 1.5 tokens");
    }

    #[test]
    fn test_refill_caps_at_burst() {
        let start = Instant::now();
        let bucket = TokenBucket {
            tokens: 0.0,
            last_refill: start,
        };

        let (updated, _) = take_token(bucket, 10.0, 5.0, start + Duration::from_secs(3600));
        assert!(updated.tokens <= 5.0);
    }

    #[test]
    fn test_limiter_tracks_clients_independently() {
        let limiter = RateLimiter::new(1);
        // Exhaust one client's burst.
        assert!(limiter.allow("10.0.0.1"));
        assert!(limiter.allow("10.0.0.1"));
        assert!(!limiter.allow("10.0.0.1"));
        // A different client is unaffected.
        assert!(limiter.allow("10.0.0.2"));
    }
}

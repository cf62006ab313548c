//! Token-bucket rate limiting, keyed per client/path/combination (§4.4).

use std::sync::Mutex;
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    ClientIp,
    UserId,
    ApiPath,
    Combined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub key_source: KeySource,
    pub capacity: f64,
    pub refill_per_sec: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// One bucket per key, refilled lazily on access rather than by a ticker —
/// matches the teacher's statistic-manager preference for on-touch state
/// over a background sweep where a sweep isn't otherwise needed.
pub struct RateLimiter {
    cfg: RateLimitConfig,
    buckets: DashMap<String, Mutex<Bucket>>,
}

pub enum Decision {
    Allow,
    Deny { retry_after_secs: u64 },
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        RateLimiter { cfg, buckets: DashMap::new() }
    }

    pub fn key_for(&self, client_ip: &str, user_id: Option<&str>, path: &str) -> String {
        match self.cfg.key_source {
            KeySource::ClientIp => client_ip.to_string(),
            KeySource::UserId => user_id.unwrap_or(client_ip).to_string(),
            KeySource::ApiPath => path.to_string(),
            KeySource::Combined => format!("{client_ip}:{}:{path}", user_id.unwrap_or("-")),
        }
    }

    pub fn check(&self, key: &str) -> Decision {
        let entry = self.buckets.entry(key.to_string()).or_insert_with(|| {
            Mutex::new(Bucket { tokens: self.cfg.capacity, last_refill: Instant::now() })
        });
        let mut bucket = entry.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.cfg.refill_per_sec).min(self.cfg.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Decision::Allow
        } else {
            let deficit = 1.0 - bucket.tokens;
            let wait = if self.cfg.refill_per_sec > 0.0 { (deficit / self.cfg.refill_per_sec).ceil() as u64 } else { 1 };
            Decision::Deny { retry_after_secs: wait.max(1) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_capacity_then_denies() {
        let limiter = RateLimiter::new(RateLimitConfig { key_source: KeySource::ClientIp, capacity: 3.0, refill_per_sec: 0.0 });
        assert!(matches!(limiter.check("1.2.3.4"), Decision::Allow));
        assert!(matches!(limiter.check("1.2.3.4"), Decision::Allow));
        assert!(matches!(limiter.check("1.2.3.4"), Decision::Allow));
        assert!(matches!(limiter.check("1.2.3.4"), Decision::Deny { .. }));
    }

    #[test]
    fn distinct_keys_have_independent_buckets() {
        let limiter = RateLimiter::new(RateLimitConfig { key_source: KeySource::ClientIp, capacity: 1.0, refill_per_sec: 0.0 });
        assert!(matches!(limiter.check("a"), Decision::Allow));
        assert!(matches!(limiter.check("b"), Decision::Allow));
        assert!(matches!(limiter.check("a"), Decision::Deny { .. }));
    }

    #[test]
    fn retry_after_is_at_least_one_second() {
        let limiter = RateLimiter::new(RateLimitConfig { key_source: KeySource::ClientIp, capacity: 1.0, refill_per_sec: 100.0 });
        limiter.check("x");
        match limiter.check("x") {
            Decision::Deny { retry_after_secs } => assert!(retry_after_secs >= 1),
            Decision::Allow => panic!("expected deny"),
        }
    }
}

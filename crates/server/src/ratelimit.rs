use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, Instant};
use tracing::debug;
use wagate_core::config::RateLimitConfig;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Outcome of one admission check, with everything the handler needs for
/// the `X-RateLimit-*` and `Retry-After` headers.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

/// HTTP-level request limiting, keyed by client IP and/or API key. Token
/// bucket per key: `burst_size` capacity refilled at `requests_per_second`.
/// Stale buckets are evicted by a background sweep.
pub struct RequestRateLimiter {
    cfg: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RequestRateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// Check every configured dimension; the request passes only if all of
    /// them have a token available.
    pub async fn check(&self, ip: Option<&str>, api_key: Option<&str>) -> RateDecision {
        if !self.cfg.enabled {
            return RateDecision {
                allowed: true,
                limit: self.cfg.burst_size,
                remaining: self.cfg.burst_size,
                retry_after_secs: 0,
            };
        }

        let mut keys = Vec::new();
        if self.cfg.by_ip {
            if let Some(ip) = ip {
                keys.push(format!("ip:{}", ip));
            }
        }
        if self.cfg.by_api_key {
            if let Some(api_key) = api_key {
                keys.push(format!("key:{}", api_key));
            }
        }
        if keys.is_empty() {
            return RateDecision {
                allowed: true,
                limit: self.cfg.burst_size,
                remaining: self.cfg.burst_size,
                retry_after_secs: 0,
            };
        }

        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let mut decision = RateDecision {
            allowed: true,
            limit: self.cfg.burst_size,
            remaining: self.cfg.burst_size,
            retry_after_secs: 0,
        };

        // First pass: every key must have a token before any is spent, so a
        // denied request consumes nothing.
        for key in &keys {
            let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
                tokens: self.cfg.burst_size as f64,
                last_refill: now,
                last_seen: now,
            });
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * self.cfg.requests_per_second)
                .min(self.cfg.burst_size as f64);
            bucket.last_refill = now;
            bucket.last_seen = now;

            if bucket.tokens < 1.0 {
                let deficit = 1.0 - bucket.tokens;
                let wait = deficit / self.cfg.requests_per_second.max(f64::MIN_POSITIVE);
                decision.allowed = false;
                decision.remaining = 0;
                decision.retry_after_secs = decision.retry_after_secs.max(wait.ceil() as u64);
            } else {
                decision.remaining = decision.remaining.min(bucket.tokens as u32 - 1);
            }
        }

        if decision.allowed {
            for key in &keys {
                if let Some(bucket) = buckets.get_mut(key) {
                    bucket.tokens -= 1.0;
                }
            }
        }
        decision
    }

    /// Background sweep evicting buckets idle past `max_age`.
    pub fn start_cleanup(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.cfg.cleanup_interval_secs.max(1));
            let max_age = Duration::from_secs(self.cfg.max_age_secs.max(1));
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let mut buckets = self.buckets.lock().await;
                let before = buckets.len();
                let now = Instant::now();
                buckets.retain(|_, bucket| now.duration_since(bucket.last_seen) < max_age);
                let evicted = before - buckets.len();
                if evicted > 0 {
                    debug!(evicted, "rate limit buckets evicted");
                }
            }
        })
    }

    #[cfg(test)]
    async fn bucket_count(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

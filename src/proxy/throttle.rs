//! Request pacing towards target hosts
//!
//! Uses the governor crate: one cell per `delay`, no burst, keyed by target host
//! (or a single shared key when pacing is global).

use crate::config::RateLimitConfig;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

/// Key used for every request when pacing is not per host
const GLOBAL_KEY: &str = "global";

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Spaces out requests so a target host sees at most one every `delay`
pub struct RequestThrottle {
    limiter: Option<KeyedLimiter>,
    per_host: bool,
}

impl RequestThrottle {
    pub fn new(config: &RateLimitConfig) -> Self {
        let limiter = if config.enabled {
            Quota::with_period(config.delay()).map(RateLimiter::keyed)
        } else {
            None
        };

        Self {
            limiter,
            per_host: config.per_host,
        }
    }

    pub fn disabled() -> Self {
        Self {
            limiter: None,
            per_host: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Rate limit key for a request to `url`
    pub fn key_for(&self, url: &Url) -> String {
        match url.host_str() {
            Some(host) if self.per_host => host.to_ascii_lowercase(),
            _ => GLOBAL_KEY.to_string(),
        }
    }

    /// Wait until a request to `url` may be sent; returns how long that took
    pub async fn wait(&self, url: &Url) -> Duration {
        let Some(limiter) = &self.limiter else {
            return Duration::ZERO;
        };

        let key = self.key_for(url);
        let start = Instant::now();
        limiter.until_key_ready(&key).await;
        let waited = start.elapsed();
        if waited >= Duration::from_millis(1) {
            debug!("Rate limiting: waited {:?} before request to {}", waited, key);
        }
        waited
    }
}

impl fmt::Debug for RequestThrottle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestThrottle")
            .field("enabled", &self.is_enabled())
            .field("per_host", &self.per_host)
            .finish()
    }
}

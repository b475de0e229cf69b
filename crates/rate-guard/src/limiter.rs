use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Requests allowed per window for one scope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateScopeConfig {
    #[serde(default = "default_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_per_hour")]
    pub requests_per_hour: u32,
}

fn default_per_minute() -> u32 {
    60
}

fn default_per_hour() -> u32 {
    1000
}

impl Default for RateScopeConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_per_minute(),
            requests_per_hour: default_per_hour(),
        }
    }
}

/// The `rate_limiting` configuration subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_global")]
    pub global: RateScopeConfig,
    #[serde(default)]
    pub per_client: RateScopeConfig,
    /// Per-method limits, applied on top of the global and client scopes.
    #[serde(default)]
    pub per_method: HashMap<String, RateScopeConfig>,
}

fn default_true() -> bool {
    true
}

fn default_global() -> RateScopeConfig {
    RateScopeConfig {
        requests_per_minute: 600,
        requests_per_hour: 10_000,
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            global: default_global(),
            per_client: RateScopeConfig::default(),
            per_method: HashMap::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded in scope '{scope}'")]
    Throttled { scope: String },
}

/// One leaky bucket: fixed capacity over a window, with a block lasting one
/// window once the capacity is exhausted.
#[derive(Debug)]
struct Bucket {
    points: u32,
    remaining: u32,
    window: Duration,
    reset_at: Instant,
    block_until: Option<Instant>,
    last_used: Instant,
}

impl Bucket {
    fn new(points: u32, window: Duration, now: Instant) -> Self {
        Self {
            points,
            remaining: points,
            window,
            reset_at: now + window,
            block_until: None,
            last_used: now,
        }
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        self.last_used = now;

        if let Some(until) = self.block_until {
            if now < until {
                return false;
            }
            self.block_until = None;
            self.remaining = self.points;
            self.reset_at = now + self.window;
        }

        if now >= self.reset_at {
            self.remaining = self.points;
            self.reset_at = now + self.window;
        }

        if self.remaining > 0 {
            self.remaining -= 1;
            true
        } else {
            self.block_until = Some(now + self.window);
            false
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }
}

/// Multi-scope admission control, shared across every connection.
///
/// For each call the applicable buckets are consumed in a fixed order:
/// global/minute, global/hour, client/minute, client/hour, method/minute,
/// method/hour. The first exhausted bucket short-circuits to a throttle;
/// buckets that already succeeded are not rolled back (a cheap over-count
/// on the denied path).
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or throttle one message from `connection_id` invoking `method`.
    pub fn check(&self, connection_id: &str, method: Option<&str>) -> Result<(), RateLimitError> {
        if !self.config.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");

        let global = self.config.global;
        let client = self.config.per_client;

        let mut stages: Vec<(String, u32, Duration)> = vec![
            ("global:minute".to_string(), global.requests_per_minute, MINUTE),
            ("global:hour".to_string(), global.requests_per_hour, HOUR),
            (
                format!("{connection_id}:minute"),
                client.requests_per_minute,
                MINUTE,
            ),
            (
                format!("{connection_id}:hour"),
                client.requests_per_hour,
                HOUR,
            ),
        ];

        if let Some(method) = method {
            if let Some(limits) = self.config.per_method.get(method) {
                stages.push((
                    format!("{connection_id}:{method}:minute"),
                    limits.requests_per_minute,
                    MINUTE,
                ));
                stages.push((
                    format!("{connection_id}:{method}:hour"),
                    limits.requests_per_hour,
                    HOUR,
                ));
            }
        }

        for (key, points, window) in stages {
            let bucket = buckets
                .entry(key.clone())
                .or_insert_with(|| Bucket::new(points, window, now));

            if !bucket.try_consume(now) {
                warn!(
                    connection = connection_id,
                    scope = %key,
                    "rate limit exceeded"
                );
                return Err(RateLimitError::Throttled { scope: key });
            }
        }

        Ok(())
    }

    /// Drop buckets idle for more than two full windows.
    pub fn gc(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");

        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.idle_for(now) <= bucket.window * 2);
        let removed = before - buckets.len();

        if removed > 0 {
            debug!(removed, "idle rate buckets collected");
        }
        removed
    }

    /// Number of live buckets, for monitoring.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().expect("rate limiter lock poisoned").len()
    }
}

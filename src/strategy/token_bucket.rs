use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use super::{decode_state, ensure_window, RateLimitStrategy, Usage, WindowInfo, TOKEN_BUCKET};
use crate::{
    cache::Cache,
    error::Result,
    result::RateLimitResult,
    utils::{SystemTimeSource, TimeSource},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBucketConfig {
    /// Tokens in a bucket created for a new key. Zero means the very first
    /// request against a key is rejected.
    pub initial_tokens: f64,
    /// Seconds a bucket outlives one refill period
    pub ttl_buffer: u64,
    /// Minimum lifetime of stored bucket state
    pub state_ttl: u64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            initial_tokens: 0.0,
            ttl_buffer: 1,
            state_ttl: 86_400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TokenBucketState {
    tokens: f64,
    last_refill: i64,
}

impl TokenBucketState {
    /// Add `elapsed * capacity / window` tokens, capped at capacity
    fn refill(&mut self, now: i64, capacity: f64, window: u64) {
        let elapsed = (now - self.last_refill).max(0) as f64;
        self.tokens = (self.tokens + elapsed * capacity / window as f64).min(capacity);
        self.last_refill = now;
    }
}

/// Round up to whole seconds, ignoring float noise below a millisecond
fn ceil_seconds(seconds: f64) -> u64 {
    ((seconds * 1_000.0).round() / 1_000.0).ceil().max(0.0) as u64
}

/// Bucket of `limit` tokens refilled continuously over `window` seconds; each
/// admitted request takes one token.
pub struct TokenBucketStrategy {
    config: TokenBucketConfig,
    time_source: Arc<dyn TimeSource>,
}

impl TokenBucketStrategy {
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            config: Self::default_config(),
            time_source,
        }
    }

    pub fn default_config() -> TokenBucketConfig {
        TokenBucketConfig::default()
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: TokenBucketConfig) {
        self.config = config;
    }

    pub fn with_config(mut self, config: TokenBucketConfig) -> Self {
        self.set_config(config);
        self
    }

    /// Force-fill the bucket for `key` to `capacity`
    pub async fn reset_bucket(
        &self,
        cache: &dyn Cache,
        key: &str,
        capacity: u64,
        window: u64,
    ) -> Result<bool> {
        ensure_window(window)?;
        let state = TokenBucketState {
            tokens: capacity as f64,
            last_refill: self.time_source.unix_now(),
        };
        info!(key = %key, capacity, "Resetting token bucket");
        self.store(cache, key, &state, window).await
    }

    fn state_ttl(&self, window: u64) -> u64 {
        (window + self.config.ttl_buffer).max(self.config.state_ttl)
    }

    async fn load(&self, cache: &dyn Cache, key: &str) -> Result<Option<TokenBucketState>> {
        Ok(decode_state(key, cache.get(key).await?))
    }

    async fn store(
        &self,
        cache: &dyn Cache,
        key: &str,
        state: &TokenBucketState,
        window: u64,
    ) -> Result<bool> {
        let encoded = serde_json::to_string(state)?;
        cache.put(key, &encoded, self.state_ttl(window)).await
    }

    fn new_bucket(&self, capacity: f64, now: i64) -> TokenBucketState {
        TokenBucketState {
            tokens: self.config.initial_tokens.clamp(0.0, capacity),
            last_refill: now,
        }
    }
}

impl Default for TokenBucketStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStrategy for TokenBucketStrategy {
    fn name(&self) -> &str {
        TOKEN_BUCKET
    }

    async fn check_limit(
        &self,
        cache: &dyn Cache,
        key: &str,
        limit: u64,
        window: u64,
    ) -> Result<RateLimitResult> {
        ensure_window(window)?;
        let now = self.time_source.unix_now();

        if limit == 0 {
            return Ok(RateLimitResult::exceeded(
                key,
                TOKEN_BUCKET,
                0,
                now + window as i64,
                window,
            ));
        }

        let capacity = limit as f64;
        let mut state = match self.load(cache, key).await? {
            Some(state) => state,
            None => self.new_bucket(capacity, now),
        };
        state.refill(now, capacity, window);

        let admitted = state.tokens >= 1.0;
        if admitted {
            state.tokens -= 1.0;
        }
        self.store(cache, key, &state, window).await?;

        // time until the bucket is full again
        let missing = capacity - state.tokens;
        let reset_time = now + ceil_seconds(missing * window as f64 / capacity) as i64;

        debug!(key = %key, tokens = state.tokens, limit, window, admitted, "token bucket check");

        if admitted {
            Ok(RateLimitResult::allowed(
                key,
                TOKEN_BUCKET,
                limit,
                state.tokens.floor() as u64,
                reset_time,
            ))
        } else {
            let retry_after = ceil_seconds((1.0 - state.tokens) * window as f64 / capacity);
            Ok(RateLimitResult::exceeded(
                key,
                TOKEN_BUCKET,
                limit,
                reset_time,
                retry_after,
            ))
        }
    }

    async fn usage(&self, cache: &dyn Cache, key: &str, window: u64) -> Result<Usage> {
        ensure_window(window)?;
        let now = self.time_source.unix_now();
        let (tokens, last_refill) = match self.load(cache, key).await? {
            Some(state) => (state.tokens, state.last_refill),
            None => (self.config.initial_tokens.max(0.0), now),
        };

        Ok(Usage {
            key: key.to_string(),
            strategy: TOKEN_BUCKET.to_string(),
            count: 0,
            window_start: last_refill,
            reset_time: last_refill + window as i64,
            tokens: Some(tokens),
        })
    }

    async fn clear_limit(&self, cache: &dyn Cache, key: &str, _window: u64) -> Result<bool> {
        cache.forget(key).await
    }

    fn window_info(&self, window: u64) -> WindowInfo {
        let now = self.time_source.unix_now();
        WindowInfo {
            strategy: TOKEN_BUCKET.to_string(),
            window,
            now,
            start: now,
            end: now + window as i64,
            refill_period: Some(window),
        }
    }
}

//! Counting algorithms. Every strategy keeps its per-key state in the shared
//! [`Cache`] and is otherwise stateless, so one instance serves every rule.
//!
//! Only the fixed window is safe under concurrent access by construction: it
//! relies on the cache's atomic increment. The sliding window and token bucket
//! read, modify and write a compound value without compare-and-swap, so
//! concurrent workers may over-admit by up to (concurrency - 1) requests per
//! key. Rate limiting here is best effort.

mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use fixed_window::{FixedWindowConfig, FixedWindowStrategy};
pub use sliding_window::{SlidingWindowConfig, SlidingWindowStrategy};
pub use token_bucket::{TokenBucketConfig, TokenBucketStrategy};

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    cache::Cache,
    error::{RateLimitError, Result},
    result::RateLimitResult,
};

pub const FIXED_WINDOW: &str = "fixed";
pub const SLIDING_WINDOW: &str = "sliding";
pub const TOKEN_BUCKET: &str = "token_bucket";

/// Strategy names understood without registering anything
pub const BUILTIN_STRATEGIES: [&str; 3] = [FIXED_WINDOW, SLIDING_WINDOW, TOKEN_BUCKET];

/// Counting algorithm maintaining per-key state in the cache
#[async_trait]
pub trait RateLimitStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Count one hit against `key` and report whether it exceeds `limit`
    /// requests per `window` seconds
    async fn check_limit(
        &self,
        cache: &dyn Cache,
        key: &str,
        limit: u64,
        window: u64,
    ) -> Result<RateLimitResult>;

    /// Current state for `key` without counting a hit
    async fn usage(&self, cache: &dyn Cache, key: &str, window: u64) -> Result<Usage>;

    /// Drop all state for `key`; the next check behaves as for a new key
    async fn clear_limit(&self, cache: &dyn Cache, key: &str, window: u64) -> Result<bool>;

    /// Boundaries the strategy would use for `window` right now
    fn window_info(&self, window: u64) -> WindowInfo;
}

/// Snapshot of the state tracked for one key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Usage {
    pub key: String,
    pub strategy: String,
    /// Requests counted in the current window (fixed and sliding)
    pub count: u64,
    /// Start of the tracked window, or the last refill for token buckets
    pub window_start: i64,
    /// When the tracked state fully resets
    pub reset_time: i64,
    /// Stored tokens, token bucket only
    pub tokens: Option<f64>,
}

/// Window or refill boundaries computed for the current time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowInfo {
    pub strategy: String,
    pub window: u64,
    pub now: i64,
    pub start: i64,
    pub end: i64,
    /// Seconds needed to refill an empty bucket, token bucket only
    pub refill_period: Option<u64>,
}

pub(crate) fn ensure_window(window: u64) -> Result<()> {
    if window == 0 {
        return Err(RateLimitError::config("window must be greater than zero"));
    }
    Ok(())
}

/// Decode a JSON state value, starting over when it is unreadable
pub(crate) fn decode_state<T>(key: &str, raw: Option<String>) -> Option<T>
where
    T: serde::de::DeserializeOwned,
{
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Discarding unreadable rate limit state");
            None
        }
    }
}

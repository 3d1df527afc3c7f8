use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::{decode_state, ensure_window, RateLimitStrategy, Usage, WindowInfo, SLIDING_WINDOW};
use crate::{
    cache::Cache,
    error::Result,
    result::RateLimitResult,
    utils::{SystemTimeSource, TimeSource},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlidingWindowConfig {
    /// Seconds the log outlives its window
    pub ttl_buffer: u64,
    /// Upper bound on stored timestamps per key. A rule whose limit is
    /// higher raises the bound to its limit.
    pub max_timestamps: usize,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            ttl_buffer: 1,
            max_timestamps: 10_000,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SlidingWindowState {
    timestamps: Vec<i64>,
}

impl SlidingWindowState {
    fn prune(&mut self, cutoff: i64) {
        self.timestamps.retain(|ts| *ts >= cutoff);
    }

    fn oldest(&self) -> Option<i64> {
        self.timestamps.iter().min().copied()
    }
}

/// Keeps a log of hit timestamps and counts the ones inside the interval
/// ending now.
///
/// The log holds at most `max(max_timestamps, limit)` entries. Admitted hits
/// never push it past the limit, so the bound only trims logs written under a
/// larger limit or by racing workers.
pub struct SlidingWindowStrategy {
    config: SlidingWindowConfig,
    time_source: Arc<dyn TimeSource>,
}

impl SlidingWindowStrategy {
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            config: Self::default_config(),
            time_source,
        }
    }

    pub fn default_config() -> SlidingWindowConfig {
        SlidingWindowConfig::default()
    }

    pub fn config(&self) -> &SlidingWindowConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: SlidingWindowConfig) {
        self.config = config;
    }

    pub fn with_config(mut self, config: SlidingWindowConfig) -> Self {
        self.set_config(config);
        self
    }

    async fn load(
        &self,
        cache: &dyn Cache,
        key: &str,
        now: i64,
        window: u64,
    ) -> Result<SlidingWindowState> {
        let mut state: SlidingWindowState =
            decode_state(key, cache.get(key).await?).unwrap_or_default();
        state.prune(now - window as i64);
        Ok(state)
    }

    async fn store(
        &self,
        cache: &dyn Cache,
        key: &str,
        state: &mut SlidingWindowState,
        limit: u64,
        window: u64,
    ) -> Result<()> {
        let cap = self
            .config
            .max_timestamps
            .max(usize::try_from(limit).unwrap_or(usize::MAX))
            .max(1);
        if state.timestamps.len() > cap {
            let overflow = state.timestamps.len() - cap;
            state.timestamps.drain(..overflow);
            debug!(key = %key, cap, "sliding window log capped");
        }

        let encoded = serde_json::to_string(state)?;
        cache
            .put(key, &encoded, window + self.config.ttl_buffer)
            .await?;
        Ok(())
    }
}

impl Default for SlidingWindowStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStrategy for SlidingWindowStrategy {
    fn name(&self) -> &str {
        SLIDING_WINDOW
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
        let mut state = self.load(cache, key, now, window).await?;
        let count = state.timestamps.len() as u64;

        debug!(key = %key, count, limit, window, "sliding window check");

        if count >= limit {
            self.store(cache, key, &mut state, limit, window).await?;
            let reset_time = state.oldest().unwrap_or(now) + window as i64;
            return Ok(RateLimitResult::exceeded(
                key,
                SLIDING_WINDOW,
                limit,
                reset_time,
                (reset_time - now).max(1) as u64,
            ));
        }

        state.timestamps.push(now);
        self.store(cache, key, &mut state, limit, window).await?;
        let reset_time = state.oldest().unwrap_or(now) + window as i64;

        Ok(RateLimitResult::allowed(
            key,
            SLIDING_WINDOW,
            limit,
            limit - count - 1,
            reset_time,
        ))
    }

    async fn usage(&self, cache: &dyn Cache, key: &str, window: u64) -> Result<Usage> {
        ensure_window(window)?;
        let now = self.time_source.unix_now();
        let state = self.load(cache, key, now, window).await?;

        Ok(Usage {
            key: key.to_string(),
            strategy: SLIDING_WINDOW.to_string(),
            count: state.timestamps.len() as u64,
            window_start: now - window as i64,
            reset_time: state.oldest().unwrap_or(now) + window as i64,
            tokens: None,
        })
    }

    async fn clear_limit(&self, cache: &dyn Cache, key: &str, _window: u64) -> Result<bool> {
        cache.forget(key).await
    }

    fn window_info(&self, window: u64) -> WindowInfo {
        let now = self.time_source.unix_now();
        WindowInfo {
            strategy: SLIDING_WINDOW.to_string(),
            window,
            now,
            start: now - window as i64,
            end: now,
            refill_period: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::MemoryCache, utils::ManualTimeSource};

    fn strategy_at(now: i64) -> (SlidingWindowStrategy, Arc<ManualTimeSource>) {
        let time = Arc::new(ManualTimeSource::new(now));
        (SlidingWindowStrategy::with_time_source(time.clone()), time)
    }

    #[tokio::test]
    async fn test_limit_then_exceeded() {
        let (strategy, time) = strategy_at(10_000);
        let cache = MemoryCache::new(100);

        for i in 1..=3u64 {
            let result = strategy.check_limit(&cache, "k", 3, 60).await.unwrap();
            assert!(!result.is_exceeded());
            assert_eq!(result.remaining(), 3 - i);
            time.advance(5);
        }

        // oldest hit at 10_000, now 10_015
        let result = strategy.check_limit(&cache, "k", 3, 60).await.unwrap();
        assert!(result.is_exceeded());
        assert_eq!(result.retry_after(), 45);
        assert_eq!(result.reset_time(), 10_060);
    }

    #[tokio::test]
    async fn test_old_entries_excluded() {
        let (strategy, time) = strategy_at(0);
        let cache = MemoryCache::new(100);

        strategy.check_limit(&cache, "k", 2, 10).await.unwrap();
        time.set(5);
        strategy.check_limit(&cache, "k", 2, 10).await.unwrap();
        assert!(strategy.check_limit(&cache, "k", 2, 10).await.unwrap().is_exceeded());

        // the hit at t=0 is older than now - window
        time.set(11);
        assert_eq!(strategy.usage(&cache, "k", 10).await.unwrap().count, 1);
        let result = strategy.check_limit(&cache, "k", 2, 10).await.unwrap();
        assert!(!result.is_exceeded());
        assert_eq!(result.remaining(), 0);
    }

    #[tokio::test]
    async fn test_rejected_hits_are_not_logged() {
        let (strategy, time) = strategy_at(100);
        let cache = MemoryCache::new(100);

        strategy.check_limit(&cache, "k", 1, 10).await.unwrap();
        for _ in 0..5 {
            assert!(strategy.check_limit(&cache, "k", 1, 10).await.unwrap().is_exceeded());
        }
        assert_eq!(strategy.usage(&cache, "k", 10).await.unwrap().count, 1);

        time.advance(11);
        assert!(!strategy.check_limit(&cache, "k", 1, 10).await.unwrap().is_exceeded());
    }

    #[tokio::test]
    async fn test_limit_above_cap_still_enforced() {
        let (strategy, _time) = strategy_at(0);
        let strategy = strategy.with_config(SlidingWindowConfig {
            max_timestamps: 3,
            ..Default::default()
        });
        let cache = MemoryCache::new(100);

        for _ in 0..10 {
            assert!(!strategy.check_limit(&cache, "k", 10, 60).await.unwrap().is_exceeded());
        }
        assert!(strategy.check_limit(&cache, "k", 10, 60).await.unwrap().is_exceeded());
        assert_eq!(strategy.usage(&cache, "k", 60).await.unwrap().count, 10);
    }

    #[tokio::test]
    async fn test_log_trimmed_when_limit_drops() {
        let (strategy, _time) = strategy_at(0);
        let strategy = strategy.with_config(SlidingWindowConfig {
            max_timestamps: 3,
            ..Default::default()
        });
        let cache = MemoryCache::new(100);

        for _ in 0..8 {
            strategy.check_limit(&cache, "k", 8, 60).await.unwrap();
        }
        // the same key under a stricter rule keeps max(cap, limit) entries
        assert!(strategy.check_limit(&cache, "k", 5, 60).await.unwrap().is_exceeded());
        assert_eq!(strategy.usage(&cache, "k", 60).await.unwrap().count, 5);
    }

    #[tokio::test]
    async fn test_clear_behaves_like_new_key() {
        let (strategy, _time) = strategy_at(50);
        let cache = MemoryCache::new(100);

        strategy.check_limit(&cache, "k", 1, 30).await.unwrap();
        assert!(strategy.check_limit(&cache, "k", 1, 30).await.unwrap().is_exceeded());

        assert!(strategy.clear_limit(&cache, "k", 30).await.unwrap());
        let fresh = strategy.check_limit(&cache, "other", 1, 30).await.unwrap();
        let cleared = strategy.check_limit(&cache, "k", 1, 30).await.unwrap();
        assert_eq!(cleared.is_exceeded(), fresh.is_exceeded());
        assert_eq!(cleared.remaining(), fresh.remaining());
    }

    #[tokio::test]
    async fn test_corrupt_state_starts_over() {
        let (strategy, _time) = strategy_at(50);
        let cache = MemoryCache::new(100);
        cache.put("k", "not json", 60).await.unwrap();

        let result = strategy.check_limit(&cache, "k", 2, 30).await.unwrap();
        assert_eq!(result.remaining(), 1);
    }

    #[test]
    fn test_window_info() {
        let (strategy, _time) = strategy_at(300);
        let info = strategy.window_info(60);
        assert_eq!((info.start, info.end), (240, 300));
        assert_eq!(strategy.config().max_timestamps, 10_000);
    }
}

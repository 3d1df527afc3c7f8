use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::{ensure_window, RateLimitStrategy, Usage, WindowInfo, FIXED_WINDOW};
use crate::{
    cache::Cache,
    error::Result,
    result::RateLimitResult,
    utils::{seconds_until_reset, window_start, SystemTimeSource, TimeSource},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedWindowConfig {
    /// Seconds a counter outlives its window
    pub ttl_buffer: u64,
}

impl Default for FixedWindowConfig {
    fn default() -> Self {
        Self { ttl_buffer: 1 }
    }
}

/// Counts hits in windows aligned to wall-clock multiples of the window
/// length. Cheapest strategy; a client can burst up to twice the limit
/// across a window boundary.
pub struct FixedWindowStrategy {
    config: FixedWindowConfig,
    time_source: Arc<dyn TimeSource>,
}

impl FixedWindowStrategy {
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            config: Self::default_config(),
            time_source,
        }
    }

    pub fn default_config() -> FixedWindowConfig {
        FixedWindowConfig::default()
    }

    pub fn config(&self) -> &FixedWindowConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: FixedWindowConfig) {
        self.config = config;
    }

    pub fn with_config(mut self, config: FixedWindowConfig) -> Self {
        self.set_config(config);
        self
    }

    /// The window start is part of the counter key, so a new window always
    /// starts from a fresh counter
    fn counter_key(key: &str, start: i64) -> String {
        format!("{}:{}", key, start)
    }
}

impl Default for FixedWindowStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStrategy for FixedWindowStrategy {
    fn name(&self) -> &str {
        FIXED_WINDOW
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
        let start = window_start(now, window);
        let reset_time = start + window as i64;
        let counter = Self::counter_key(key, start);

        let count = cache
            .increment_with_ttl(&counter, 1, window + self.config.ttl_buffer)
            .await?
            .max(0) as u64;

        debug!(key = %key, count, limit, window, "fixed window check");

        if count > limit {
            Ok(RateLimitResult::exceeded(
                key,
                FIXED_WINDOW,
                limit,
                reset_time,
                seconds_until_reset(now, window),
            ))
        } else {
            Ok(RateLimitResult::allowed(
                key,
                FIXED_WINDOW,
                limit,
                limit - count,
                reset_time,
            ))
        }
    }

    async fn usage(&self, cache: &dyn Cache, key: &str, window: u64) -> Result<Usage> {
        ensure_window(window)?;
        let now = self.time_source.unix_now();
        let start = window_start(now, window);
        let count = cache
            .get(&Self::counter_key(key, start))
            .await?
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0)
            .max(0) as u64;

        Ok(Usage {
            key: key.to_string(),
            strategy: FIXED_WINDOW.to_string(),
            count,
            window_start: start,
            reset_time: start + window as i64,
            tokens: None,
        })
    }

    async fn clear_limit(&self, cache: &dyn Cache, key: &str, window: u64) -> Result<bool> {
        ensure_window(window)?;
        let start = window_start(self.time_source.unix_now(), window);
        cache.forget(&Self::counter_key(key, start)).await
    }

    fn window_info(&self, window: u64) -> WindowInfo {
        let now = self.time_source.unix_now();
        let start = window_start(now, window);
        WindowInfo {
            strategy: FIXED_WINDOW.to_string(),
            window,
            now,
            start,
            end: start + window.max(1) as i64,
            refill_period: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::MemoryCache, utils::ManualTimeSource};

    fn strategy_at(now: i64) -> (FixedWindowStrategy, Arc<ManualTimeSource>) {
        let time = Arc::new(ManualTimeSource::new(now));
        (FixedWindowStrategy::with_time_source(time.clone()), time)
    }

    #[tokio::test]
    async fn test_limit_then_exceeded() {
        let (strategy, _time) = strategy_at(1_000);
        let cache = MemoryCache::new(100);

        for i in 1..=5u64 {
            let result = strategy.check_limit(&cache, "k", 5, 60).await.unwrap();
            assert!(!result.is_exceeded(), "call {} should pass", i);
            assert_eq!(result.remaining(), 5 - i);
            assert_eq!(result.reset_time(), 1_020);
        }

        let result = strategy.check_limit(&cache, "k", 5, 60).await.unwrap();
        assert!(result.is_exceeded());
        assert_eq!(result.remaining(), 0);
        assert_eq!(result.retry_after(), 20);
        assert_eq!(result.strategy(), "fixed");
    }

    #[tokio::test]
    async fn test_windows_align_to_wall_clock() {
        let (strategy, time) = strategy_at(1_019);
        let cache = MemoryCache::new(100);

        let result = strategy.check_limit(&cache, "k", 1, 60).await.unwrap();
        assert!(!result.is_exceeded());
        assert!(strategy.check_limit(&cache, "k", 1, 60).await.unwrap().is_exceeded());

        // next aligned window starts at 1_020, one second later
        time.advance(1);
        let result = strategy.check_limit(&cache, "k", 1, 60).await.unwrap();
        assert!(!result.is_exceeded());
        assert_eq!(result.reset_time(), 1_080);
    }

    #[tokio::test]
    async fn test_usage_and_clear() {
        let (strategy, _time) = strategy_at(500);
        let cache = MemoryCache::new(100);

        strategy.check_limit(&cache, "k", 3, 10).await.unwrap();
        strategy.check_limit(&cache, "k", 3, 10).await.unwrap();

        let usage = strategy.usage(&cache, "k", 10).await.unwrap();
        assert_eq!(usage.count, 2);
        assert_eq!(usage.window_start, 500);
        assert_eq!(usage.reset_time, 510);

        assert!(strategy.clear_limit(&cache, "k", 10).await.unwrap());
        assert_eq!(strategy.usage(&cache, "k", 10).await.unwrap().count, 0);

        let result = strategy.check_limit(&cache, "k", 3, 10).await.unwrap();
        assert_eq!(result.remaining(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_hits_all_counted() {
        let (strategy, _time) = strategy_at(2_000);
        let strategy = Arc::new(strategy);
        let cache = Arc::new(MemoryCache::new(100));

        let mut handles = Vec::new();
        for _ in 0..64 {
            let strategy = strategy.clone();
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                strategy
                    .check_limit(cache.as_ref(), "k", 64, 60)
                    .await
                    .unwrap()
                    .is_exceeded()
            }));
        }
        for handle in handles {
            assert!(!handle.await.unwrap());
        }

        assert_eq!(strategy.usage(cache.as_ref(), "k", 60).await.unwrap().count, 64);
        assert!(strategy.check_limit(cache.as_ref(), "k", 64, 60).await.unwrap().is_exceeded());
    }

    #[tokio::test]
    async fn test_zero_window_rejected() {
        let (strategy, _time) = strategy_at(0);
        let cache = MemoryCache::new(10);
        assert!(strategy.check_limit(&cache, "k", 1, 0).await.is_err());
    }

    #[test]
    fn test_window_info_and_config() {
        let (mut strategy, _time) = strategy_at(125);
        let info = strategy.window_info(60);
        assert_eq!((info.start, info.end), (120, 180));

        assert_eq!(strategy.config(), &FixedWindowStrategy::default_config());
        strategy.set_config(FixedWindowConfig { ttl_buffer: 30 });
        assert_eq!(strategy.config().ttl_buffer, 30);
    }
}

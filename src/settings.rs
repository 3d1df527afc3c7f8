use serde::Deserialize;

use crate::{
    config::{RateLimitConfig, RawRateLimitConfig, DEFAULT_CACHE_PREFIX, DEFAULT_TIMEOUT_MS},
    error::{RateLimitError, Result},
    manager::{strategy_factory, RateLimitManager, DEFAULT_LOCAL_CACHE_SIZE},
    redis::RedisConfig,
    strategy::{
        FixedWindowConfig, FixedWindowStrategy, SlidingWindowConfig, SlidingWindowStrategy,
        TokenBucketConfig, TokenBucketStrategy, FIXED_WINDOW, SLIDING_WINDOW, TOKEN_BUCKET,
    },
};

/// Tuning for the built-in strategies
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    pub fixed: FixedWindowConfig,
    pub sliding: SlidingWindowConfig,
    pub token_bucket: TokenBucketConfig,
}

/// Process settings for the `throttle-gate` binary
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub http_addr: String,
    /// Use a Redis store as the `default` cache when set
    pub redis: Option<RedisConfig>,
    pub local_cache_size: u64,
    pub enabled: bool,
    /// Rules in the grammar form, e.g. `100,60|10,1,token_bucket`
    pub rules: Option<String>,
    /// YAML rate limit config; takes precedence over `rules`
    pub rules_file: Option<String>,
    pub cache_prefix: String,
    pub timeout_ms: u64,
    pub strategies: StrategySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            redis: None,
            local_cache_size: DEFAULT_LOCAL_CACHE_SIZE,
            enabled: true,
            rules: None,
            rules_file: None,
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            strategies: StrategySettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from `config/default`, `config/local` and
    /// `THROTTLE_GATE__*` environment variables, later sources winning
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("THROTTLE_GATE").separator("__"))
            .build()?;
        Self::from_config(config)
    }

    pub fn from_config(config: config::Config) -> Result<Self> {
        Ok(config.try_deserialize()?)
    }

    /// Re-register the built-in strategies of `manager` with the configured
    /// tuning
    pub fn configure_strategies(&self, manager: &RateLimitManager) -> Result<()> {
        let fixed = self.strategies.fixed.clone();
        manager.register_strategy(
            FIXED_WINDOW,
            strategy_factory(move || FixedWindowStrategy::new().with_config(fixed.clone())),
        )?;

        let sliding = self.strategies.sliding.clone();
        manager.register_strategy(
            SLIDING_WINDOW,
            strategy_factory(move || SlidingWindowStrategy::new().with_config(sliding.clone())),
        )?;

        let token_bucket = self.strategies.token_bucket.clone();
        manager.register_strategy(
            TOKEN_BUCKET,
            strategy_factory(move || {
                TokenBucketStrategy::new().with_config(token_bucket.clone())
            }),
        )?;
        Ok(())
    }

    /// The rate limit config these settings describe, validated against
    /// `manager`. `None` when no rules are configured.
    pub fn rate_limit_config(&self, manager: &RateLimitManager) -> Result<Option<RateLimitConfig>> {
        if let Some(path) = &self.rules_file {
            let content = std::fs::read_to_string(path)?;
            let raw: RawRateLimitConfig = serde_yaml::from_str(&content).map_err(|e| {
                RateLimitError::Config(format!("Failed to parse YAML in {}: {}", path, e))
            })?;
            return manager.load_config(raw).map(Some);
        }

        match self.rules.as_deref().map(str::trim) {
            Some(rules) if !rules.is_empty() => {
                let config = manager
                    .parse_config(rules)?
                    .with_enabled(self.enabled)
                    .with_cache_prefix(self.cache_prefix.clone())
                    .with_timeout_ms(self.timeout_ms);
                Ok(Some(config))
            }
            _ => Ok(None),
        }
    }
}

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::{
    error::{RateLimitError, Result},
    resolver::KeyResolverSpec,
    strategy::{BUILTIN_STRATEGIES, FIXED_WINDOW},
    utils::generate_cache_key,
};

pub const DEFAULT_CACHE_STORE: &str = "default";
pub const DEFAULT_CACHE_PREFIX: &str = "rate_limit";
pub const DEFAULT_TIMEOUT_MS: u64 = 250;

/// One quota: `limit` requests per `window` seconds, counted by `strategy`
/// under the key produced by `key_resolver`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitRule {
    pub limit: u64,
    pub window: u64,
    pub strategy: String,
    pub key_resolver: KeyResolverSpec,
}

impl LimitRule {
    /// A rule with the default strategy and key resolver
    pub fn new(limit: u64, window: u64) -> Result<Self> {
        Self::with(limit, window, FIXED_WINDOW, KeyResolverSpec::default())
    }

    pub fn with(
        limit: u64,
        window: u64,
        strategy: impl Into<String>,
        key_resolver: KeyResolverSpec,
    ) -> Result<Self> {
        let rule = Self {
            limit,
            window,
            strategy: strategy.into().trim().to_lowercase(),
            key_resolver,
        };
        rule.validate()?;
        Ok(rule)
    }

    /// Parse `<limit>,<window>[,<strategy>[,<keyResolver>]]`
    pub fn parse_with<F>(text: &str, is_known_strategy: F) -> Result<Self>
    where
        F: Fn(&str) -> bool,
    {
        let fields: Vec<&str> = text.split(',').map(str::trim).collect();
        if fields.len() < 2 {
            return Err(RateLimitError::config(format!(
                "rate limit rule '{}' needs at least '<limit>,<window>'",
                text.trim()
            )));
        }
        if fields.len() > 4 {
            return Err(RateLimitError::config(format!(
                "rate limit rule '{}' has more than four fields",
                text.trim()
            )));
        }

        let limit = parse_positive("limit", fields[0])?;
        let window = parse_positive("window", fields[1])?;
        let strategy = fields
            .get(2)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| FIXED_WINDOW.to_string());
        ensure_known_strategy(&strategy, &is_known_strategy)?;

        let key_resolver = match fields.get(3).filter(|s| !s.is_empty()) {
            Some(raw) => KeyResolverSpec::parse(raw)?,
            None => KeyResolverSpec::default(),
        };

        Self::with(limit, window, strategy, key_resolver)
    }

    fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(RateLimitError::config("limit must be greater than zero"));
        }
        if self.window == 0 {
            return Err(RateLimitError::config("window must be greater than zero"));
        }
        if self.strategy.is_empty() {
            return Err(RateLimitError::config("strategy must not be empty"));
        }
        self.key_resolver.validate()
    }

    /// Storage key for a resolved request key under this rule
    pub fn cache_key(&self, prefix: &str, resolved: &str) -> String {
        generate_cache_key(prefix, &self.strategy, resolved)
    }
}

impl fmt::Display for LimitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.limit, self.window, self.strategy, self.key_resolver
        )
    }
}

/// Which rate limit headers the middleware emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderOptions {
    pub limit: bool,
    pub remaining: bool,
    pub reset: bool,
    pub retry_after: bool,
}

impl Default for HeaderOptions {
    fn default() -> Self {
        Self {
            limit: true,
            remaining: true,
            reset: true,
            retry_after: true,
        }
    }
}

impl HeaderOptions {
    pub fn none() -> Self {
        Self {
            limit: false,
            remaining: false,
            reset: false,
            retry_after: false,
        }
    }
}

/// Validated rate limit configuration for one route or route group.
///
/// Built once, from the rule grammar or from structured config, and
/// immutable afterwards. Rules are evaluated in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimitConfig")]
pub struct RateLimitConfig {
    enabled: bool,
    limits: Vec<LimitRule>,
    cache_store: String,
    cache_prefix: String,
    headers: HeaderOptions,
    timeout_ms: u64,
    error_message: Option<String>,
}

impl RateLimitConfig {
    /// Parse a rule string such as `"100,60"` or
    /// `"10,1,token_bucket,header:X-Key|1000,3600,sliding,user"`
    pub fn from_parameters(text: &str) -> Result<Self> {
        Self::parse_with(text, is_builtin_strategy)
    }

    /// Parse a rule string, accepting every strategy `is_known_strategy`
    /// recognises
    pub fn parse_with<F>(text: &str, is_known_strategy: F) -> Result<Self>
    where
        F: Fn(&str) -> bool,
    {
        let text = text.trim();
        if text.is_empty() {
            return Err(RateLimitError::config("rate limit rule must not be empty"));
        }

        let limits = text
            .split('|')
            .map(|rule| LimitRule::parse_with(rule, &is_known_strategy))
            .collect::<Result<Vec<_>>>()?;
        Self::from_rules(limits)
    }

    /// Structured construction from already built rules
    pub fn from_rules(limits: Vec<LimitRule>) -> Result<Self> {
        if limits.is_empty() {
            return Err(RateLimitError::config(
                "rate limit config needs at least one rule",
            ));
        }
        for rule in &limits {
            rule.validate()?;
        }

        Ok(Self {
            enabled: true,
            limits,
            cache_store: DEFAULT_CACHE_STORE.to_string(),
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            headers: HeaderOptions::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            error_message: None,
        })
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_cache_store(mut self, store: impl Into<String>) -> Self {
        self.cache_store = store.into();
        self
    }

    pub fn with_cache_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_prefix = prefix.into();
        self
    }

    pub fn with_headers(mut self, headers: HeaderOptions) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms.max(1);
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limits(&self) -> &[LimitRule] {
        &self.limits
    }

    pub fn has_multiple_limits(&self) -> bool {
        self.limits.len() > 1
    }

    pub fn cache_store(&self) -> &str {
        &self.cache_store
    }

    pub fn cache_prefix(&self) -> &str {
        &self.cache_prefix
    }

    pub fn headers(&self) -> HeaderOptions {
        self.headers
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Render the rules back into the rule grammar
    pub fn to_parameters(&self) -> String {
        self.limits
            .iter()
            .map(|rule| rule.to_string())
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Structured form of this config; deserializing it yields an equal config
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

impl FromStr for RateLimitConfig {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_parameters(s)
    }
}

/// Structured configuration as written in YAML or JSON, before validation
#[derive(Debug, Clone, Deserialize)]
pub struct RawRateLimitConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Rules in the grammar form, evaluated before `limits`
    #[serde(default)]
    pub rules: Option<String>,
    #[serde(default)]
    pub limits: Vec<RawLimitRule>,
    #[serde(default = "default_cache_store")]
    pub cache_store: String,
    #[serde(default = "default_cache_prefix")]
    pub cache_prefix: String,
    #[serde(default)]
    pub headers: HeaderOptions,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLimitRule {
    pub limit: i64,
    pub window: i64,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub key_resolver: Option<RawKeyResolver>,
}

/// A key resolver given either in grammar form or as `{type, ...params}`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawKeyResolver {
    Name(String),
    Spec(KeyResolverSpec),
}

impl RawKeyResolver {
    pub fn into_spec(self) -> Result<KeyResolverSpec> {
        match self {
            RawKeyResolver::Name(name) => KeyResolverSpec::parse(&name),
            RawKeyResolver::Spec(spec) => {
                spec.validate()?;
                Ok(spec)
            }
        }
    }
}

impl RawRateLimitConfig {
    /// Validate into a [`RateLimitConfig`], accepting every strategy
    /// `is_known_strategy` recognises
    pub fn into_config_with<F>(self, is_known_strategy: F) -> Result<RateLimitConfig>
    where
        F: Fn(&str) -> bool,
    {
        let mut limits = Vec::new();
        if let Some(rules) = self.rules.as_deref() {
            let parsed = RateLimitConfig::parse_with(rules, &is_known_strategy)?;
            limits.extend(parsed.limits);
        }
        for raw in self.limits {
            let limit = positive("limit", raw.limit)?;
            let window = positive("window", raw.window)?;
            let strategy = raw.strategy.trim().to_lowercase();
            ensure_known_strategy(&strategy, &is_known_strategy)?;
            let key_resolver = match raw.key_resolver {
                Some(raw) => raw.into_spec()?,
                None => KeyResolverSpec::default(),
            };
            limits.push(LimitRule::with(limit, window, strategy, key_resolver)?);
        }

        let mut config = RateLimitConfig::from_rules(limits)?
            .with_enabled(self.enabled)
            .with_cache_store(self.cache_store)
            .with_cache_prefix(self.cache_prefix)
            .with_headers(self.headers)
            .with_timeout_ms(self.timeout_ms);
        if let Some(message) = self.error_message {
            config = config.with_error_message(message);
        }
        Ok(config)
    }
}

impl TryFrom<RawRateLimitConfig> for RateLimitConfig {
    type Error = RateLimitError;

    fn try_from(raw: RawRateLimitConfig) -> Result<Self> {
        raw.into_config_with(is_builtin_strategy)
    }
}

pub fn is_builtin_strategy(name: &str) -> bool {
    BUILTIN_STRATEGIES.contains(&name)
}

fn ensure_known_strategy<F>(name: &str, is_known_strategy: &F) -> Result<()>
where
    F: Fn(&str) -> bool,
{
    if is_known_strategy(name) {
        Ok(())
    } else {
        Err(RateLimitError::config(format!("unknown strategy '{}'", name)))
    }
}

fn parse_positive(field: &str, raw: &str) -> Result<u64> {
    let value = raw.parse::<i64>().map_err(|_| {
        RateLimitError::config(format!("{} must be an integer, got '{}'", field, raw))
    })?;
    positive(field, value)
}

fn positive(field: &str, value: i64) -> Result<u64> {
    if value <= 0 {
        return Err(RateLimitError::config(format!(
            "{} must be greater than zero, got {}",
            field, value
        )));
    }
    Ok(value as u64)
}

fn default_enabled() -> bool {
    true
}

fn default_strategy() -> String {
    FIXED_WINDOW.to_string()
}

fn default_cache_store() -> String {
    DEFAULT_CACHE_STORE.to_string()
}

fn default_cache_prefix() -> String {
    DEFAULT_CACHE_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Load configuration from YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<RateLimitConfig> {
    serde_yaml::from_str(yaml)
        .map_err(|e| RateLimitError::Config(format!("Failed to parse YAML: {}", e)))
}

/// Load configuration from YAML file
pub fn load_config_from_file(path: &str) -> Result<RateLimitConfig> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}

use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur while configuring or evaluating rate limits
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Key resolver error: {0}")]
    Resolver(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),
}

impl RateLimitError {
    /// Configuration errors are raised at parse or registration time and are fatal
    pub fn is_config(&self) -> bool {
        matches!(self, RateLimitError::Config(_) | RateLimitError::Settings(_))
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        RateLimitError::Config(msg.into())
    }
}

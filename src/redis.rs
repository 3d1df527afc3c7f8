use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{info, warn};

use crate::{
    cache::Cache,
    error::{RateLimitError, Result},
    metrics::Metrics,
};

/// Redis client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout_ms: 5_000,
            command_timeout_ms: 1_000,
        }
    }
}

impl RedisConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Redis-backed cache store, shared by every instance of the service
#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
    config: RedisConfig,
    metrics: Option<Arc<Metrics>>,
}

impl RedisCache {
    /// Connect to Redis and verify the connection with a PING
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis cache for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::Redis(e)
        })?;

        let connection = match tokio::time::timeout(
            config.connection_timeout(),
            client.get_connection_manager(),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(RateLimitError::Redis(e));
            }
            Err(_) => {
                warn!(
                    "Timeout while creating connection manager ({}ms)",
                    config.connection_timeout_ms
                );
                return Err(RateLimitError::Timeout(config.connection_timeout_ms));
            }
        };

        let cache = Self {
            connection,
            config,
            metrics: None,
        };
        cache.health_check().await?;

        info!("Redis cache initialized successfully");
        Ok(cache)
    }

    /// Record operation counts and durations into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run a single command bounded by the configured command timeout
    async fn bounded<T, F>(&self, operation: &str, command: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.command_timeout(), command).await {
            Ok(result) => result.map_err(RateLimitError::Redis),
            Err(_) => Err(RateLimitError::Timeout(self.config.command_timeout_ms)),
        };

        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(_) => "success",
                Err(RateLimitError::Timeout(_)) => "timeout",
                Err(_) => "error",
            };
            metrics.record_cache_operation(operation, outcome);
            metrics.record_cache_operation_duration(operation, started.elapsed().as_secs_f64());
        }
        result
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        self.bounded(
            "get",
            redis::cmd("GET")
                .arg(key)
                .query_async::<_, Option<String>>(&mut conn),
        )
        .await
    }

    async fn put(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if ttl_seconds > 0 {
            cmd.arg("EX").arg(ttl_seconds);
        }
        self.bounded("set", cmd.query_async::<_, ()>(&mut conn))
            .await?;
        Ok(true)
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        let mut conn = self.connection.clone();
        self.bounded(
            "incrby",
            redis::cmd("INCRBY")
                .arg(key)
                .arg(by)
                .query_async::<_, i64>(&mut conn),
        )
        .await
    }

    async fn decrement(&self, key: &str, by: i64) -> Result<i64> {
        let mut conn = self.connection.clone();
        self.bounded(
            "decrby",
            redis::cmd("DECRBY")
                .arg(key)
                .arg(by)
                .query_async::<_, i64>(&mut conn),
        )
        .await
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let count = self
            .bounded(
                "exists",
                redis::cmd("EXISTS").arg(key).query_async::<_, i64>(&mut conn),
            )
            .await?;
        Ok(count > 0)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        let mut conn = self.connection.clone();
        let mut cmd = if ttl_seconds > 0 {
            let mut cmd = redis::cmd("EXPIRE");
            cmd.arg(key).arg(ttl_seconds);
            cmd
        } else {
            let mut cmd = redis::cmd("PERSIST");
            cmd.arg(key);
            cmd
        };
        let updated = self
            .bounded("expire", cmd.query_async::<_, i64>(&mut conn))
            .await?;
        // PERSIST answers 0 for a key without expiry
        if updated == 0 && ttl_seconds == 0 {
            return self.has(key).await;
        }
        Ok(updated > 0)
    }

    /// INCRBY and EXPIRE in one atomic pipeline; the TTL restarts on every call
    async fn increment_with_ttl(&self, key: &str, by: i64, ttl_seconds: u64) -> Result<i64> {
        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("INCRBY").arg(key).arg(by);
        if ttl_seconds > 0 {
            pipe.cmd("EXPIRE").arg(key).arg(ttl_seconds).ignore();
        }
        let (count,): (i64,) = self
            .bounded("incrby_expire", pipe.query_async(&mut conn))
            .await?;
        Ok(count)
    }

    async fn forget(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed = self
            .bounded(
                "del",
                redis::cmd("DEL").arg(key).query_async::<_, i64>(&mut conn),
            )
            .await?;
        Ok(removed > 0)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.bounded("ping", redis::cmd("PING").query_async::<_, ()>(&mut conn))
            .await
    }
}

use async_trait::async_trait;
use moka::{
    future::Cache as MokaCache,
    ops::compute::{CompResult, Op},
    Expiry,
};
use std::time::{Duration, Instant};

use crate::error::{RateLimitError, Result};

/// Key/value store holding all per-key limiter state.
///
/// This is the only state shared between requests. Implementations must make
/// `increment`/`decrement` atomic per key; nothing else is assumed to be.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Read a value, `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value. A `ttl_seconds` of 0 stores without expiry.
    async fn put(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool>;

    /// Atomically add `by` to an integer value, creating it at 0 when absent
    async fn increment(&self, key: &str, by: i64) -> Result<i64>;

    /// Atomically subtract `by` from an integer value, creating it at 0 when absent
    async fn decrement(&self, key: &str, by: i64) -> Result<i64>;

    async fn has(&self, key: &str) -> Result<bool>;

    /// Expire an existing key `ttl_seconds` from now, returning whether it
    /// existed. A `ttl_seconds` of 0 removes the expiry.
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool>;

    /// Atomically add `by` to a counter and make sure it expires.
    ///
    /// The TTL is set when the increment creates the counter, so concurrent
    /// callers never reset each other's counts. Stores able to pipeline the
    /// two commands may refresh the TTL on every call instead.
    async fn increment_with_ttl(&self, key: &str, by: i64, ttl_seconds: u64) -> Result<i64> {
        let value = self.increment(key, by).await?;
        if value == by {
            self.expire(key, ttl_seconds).await?;
        }
        Ok(value)
    }

    /// Remove a key, returning whether it existed
    async fn forget(&self, key: &str) -> Result<bool>;

    /// Health check for the store
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct StoredValue {
    data: String,
    ttl: Option<Duration>,
    // puts restart the TTL, counter updates keep the remaining one
    refresh_ttl: bool,
}

struct StoredValueExpiry;

impl Expiry<String, StoredValue> for StoredValueExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredValue,
        _current_time: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _current_time: Instant,
        duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        if value.refresh_ttl {
            value.ttl
        } else {
            duration_until_expiry
        }
    }
}

/// In-process cache backed by moka with per-entry expiration
#[derive(Clone)]
pub struct MemoryCache {
    entries: MokaCache<String, StoredValue>,
}

impl MemoryCache {
    /// Create a new in-memory cache holding at most `max_capacity` keys
    pub fn new(max_capacity: u64) -> Self {
        let entries = MokaCache::builder()
            .max_capacity(max_capacity)
            .expire_after(StoredValueExpiry)
            .build();

        Self { entries }
    }

    /// Number of live entries (approximate until pending tasks run)
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    async fn add(&self, key: &str, by: i64) -> Result<i64> {
        let entry = self
            .entries
            .entry(key.to_string())
            .and_upsert_with(|existing| async move {
                match existing {
                    Some(entry) => {
                        let current = entry.into_value();
                        match current.data.parse::<i64>() {
                            Ok(count) => StoredValue {
                                data: count.saturating_add(by).to_string(),
                                ttl: current.ttl,
                                refresh_ttl: false,
                            },
                            Err(_) => current,
                        }
                    }
                    None => StoredValue {
                        data: by.to_string(),
                        ttl: None,
                        refresh_ttl: false,
                    },
                }
            })
            .await;

        entry.into_value().data.parse::<i64>().map_err(|_| {
            RateLimitError::Cache(format!("value at {} is not an integer", key))
        })
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).await.map(|value| value.data))
    }

    async fn put(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool> {
        let ttl = (ttl_seconds > 0).then(|| Duration::from_secs(ttl_seconds));
        self.entries
            .insert(
                key.to_string(),
                StoredValue {
                    data: value.to_string(),
                    ttl,
                    refresh_ttl: true,
                },
            )
            .await;
        Ok(true)
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        self.add(key, by).await
    }

    async fn decrement(&self, key: &str, by: i64) -> Result<i64> {
        self.add(key, -by).await
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        let ttl = (ttl_seconds > 0).then(|| Duration::from_secs(ttl_seconds));
        let result = self
            .entries
            .entry(key.to_string())
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(entry) => Op::Put(StoredValue {
                        ttl,
                        refresh_ttl: true,
                        ..entry.into_value()
                    }),
                    None => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;

        Ok(matches!(result, CompResult::ReplacedWith(_)))
    }

    async fn forget(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).await.is_some())
    }
}

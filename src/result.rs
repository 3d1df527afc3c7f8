use serde::Serialize;

/// Outcome of a single limit check. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    exceeded: bool,
    limit: u64,
    remaining: u64,
    reset_time: i64,
    retry_after: u64,
    key: String,
    strategy: String,
}

impl RateLimitResult {
    /// A check that admitted the request
    pub fn allowed(
        key: impl Into<String>,
        strategy: impl Into<String>,
        limit: u64,
        remaining: u64,
        reset_time: i64,
    ) -> Self {
        Self {
            exceeded: false,
            limit,
            remaining: remaining.min(limit),
            reset_time,
            retry_after: 0,
            key: key.into(),
            strategy: strategy.into(),
        }
    }

    /// A check that rejected the request. Remaining is always 0 and
    /// `retry_after` is at least one second.
    pub fn exceeded(
        key: impl Into<String>,
        strategy: impl Into<String>,
        limit: u64,
        reset_time: i64,
        retry_after: u64,
    ) -> Self {
        Self {
            exceeded: true,
            limit,
            remaining: 0,
            reset_time,
            retry_after: retry_after.max(1),
            key: key.into(),
            strategy: strategy.into(),
        }
    }

    pub fn is_exceeded(&self) -> bool {
        self.exceeded
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Unix timestamp at which the window or bucket is fully reset
    pub fn reset_time(&self) -> i64 {
        self.reset_time
    }

    /// Seconds until another request can be admitted; 0 when not exceeded
    pub fn retry_after(&self) -> u64 {
        self.retry_after
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    /// Whether this result is tighter than `other` for response headers:
    /// fewer remaining requests, then the smaller quota
    pub fn is_more_restrictive_than(&self, other: &RateLimitResult) -> bool {
        (self.remaining, self.limit) < (other.remaining, other.limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_clamps_remaining() {
        let result = RateLimitResult::allowed("k", "fixed", 10, 25, 100);
        assert!(!result.is_exceeded());
        assert_eq!(result.remaining(), 10);
        assert_eq!(result.retry_after(), 0);
    }

    #[test]
    fn test_exceeded_has_no_remaining() {
        let result = RateLimitResult::exceeded("k", "sliding", 5, 200, 0);
        assert!(result.is_exceeded());
        assert_eq!(result.remaining(), 0);
        assert_eq!(result.retry_after(), 1);
        assert_eq!(result.strategy(), "sliding");
    }

    #[test]
    fn test_restrictiveness_ordering() {
        let loose = RateLimitResult::allowed("a", "fixed", 100, 90, 0);
        let tight = RateLimitResult::allowed("b", "fixed", 10, 3, 0);
        let tie = RateLimitResult::allowed("c", "fixed", 5, 3, 0);

        assert!(tight.is_more_restrictive_than(&loose));
        assert!(!loose.is_more_restrictive_than(&tight));
        assert!(tie.is_more_restrictive_than(&tight));
    }
}

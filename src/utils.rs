use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of wall-clock time for rate limiting calculations
pub trait TimeSource: Send + Sync {
    /// Get the current Unix timestamp in seconds
    fn unix_now(&self) -> i64;
}

/// Time source backed by the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn unix_now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Time source that only moves when told to. Used to drive window math in tests
/// and for replaying traffic.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicI64,
}

impl ManualTimeSource {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn unix_now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Start of the wall-clock aligned window containing `now`
pub fn window_start(now: i64, window: u64) -> i64 {
    let size = window.max(1) as i64;
    now - now.rem_euclid(size)
}

/// Seconds until the aligned window containing `now` ends
pub fn seconds_until_reset(now: i64, window: u64) -> u64 {
    let end = window_start(now, window) + window.max(1) as i64;
    (end - now) as u64
}

/// Build the storage key `{prefix}:{strategy}:{resolved}` for a rule
pub fn generate_cache_key(prefix: &str, strategy: &str, resolved: &str) -> String {
    if prefix.is_empty() {
        format!("{}:{}", strategy, resolved)
    } else {
        format!("{}:{}:{}", prefix, strategy, resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_alignment() {
        assert_eq!(window_start(1_000, 60), 960);
        assert_eq!(window_start(960, 60), 960);
        assert_eq!(window_start(1_019, 1), 1_019);
        assert_eq!(seconds_until_reset(1_000, 60), 20);
        assert_eq!(seconds_until_reset(960, 60), 60);
    }

    #[test]
    fn test_cache_key_generation() {
        assert_eq!(
            generate_cache_key("rate_limit", "fixed", "ip:10.0.0.1"),
            "rate_limit:fixed:ip:10.0.0.1"
        );
        assert_eq!(generate_cache_key("", "sliding", "user:7"), "sliding:user:7");
    }

    #[test]
    fn test_manual_time_source() {
        let time = ManualTimeSource::new(100);
        assert_eq!(time.unix_now(), 100);
        time.advance(25);
        assert_eq!(time.unix_now(), 125);
        time.set(10);
        assert_eq!(time.unix_now(), 10);
    }
}

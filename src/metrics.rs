use prometheus::{CounterVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the admission middleware and its cache stores
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Admission metrics
    checks: CounterVec,
    blocked_requests: CounterVec,
    fail_open: CounterVec,
    check_duration: Histogram,

    // Cache metrics
    cache_operations: CounterVec,
    cache_operation_duration: HistogramVec,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let checks = CounterVec::new(
            Opts::new(
                "throttle_gate_checks_total",
                "Rate limit rule checks by strategy and outcome",
            ),
            &["strategy", "outcome"],
        )?;

        let blocked_requests = CounterVec::new(
            Opts::new(
                "throttle_gate_blocked_requests_total",
                "Requests rejected with 429, by the strategy of the rule that blocked them",
            ),
            &["strategy"],
        )?;

        let fail_open = CounterVec::new(
            Opts::new(
                "throttle_gate_fail_open_total",
                "Requests let through because evaluation failed",
            ),
            &["reason"],
        )?;

        let check_duration = Histogram::with_opts(HistogramOpts::new(
            "throttle_gate_check_duration_seconds",
            "Time spent evaluating all rules for one request",
        ))?;

        let cache_operations = CounterVec::new(
            Opts::new(
                "throttle_gate_cache_operations_total",
                "Cache store operations by type and result",
            ),
            &["operation", "result"],
        )?;

        let cache_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "throttle_gate_cache_operation_duration_seconds",
                "Duration of cache store operations in seconds",
            ),
            &["operation"],
        )?;

        registry.register(Box::new(checks.clone()))?;
        registry.register(Box::new(blocked_requests.clone()))?;
        registry.register(Box::new(fail_open.clone()))?;
        registry.register(Box::new(check_duration.clone()))?;
        registry.register(Box::new(cache_operations.clone()))?;
        registry.register(Box::new(cache_operation_duration.clone()))?;

        Ok(Self {
            registry,
            checks,
            blocked_requests,
            fail_open,
            check_duration,
            cache_operations,
            cache_operation_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one rule check; `outcome` is `allowed` or `exceeded`
    pub fn record_check(&self, strategy: &str, outcome: &str) {
        self.checks.with_label_values(&[strategy, outcome]).inc();
    }

    pub fn record_blocked(&self, strategy: &str) {
        self.blocked_requests.with_label_values(&[strategy]).inc();
    }

    /// Record a request admitted because evaluation failed; `reason` is
    /// `timeout` or `error`
    pub fn record_fail_open(&self, reason: &str) {
        self.fail_open.with_label_values(&[reason]).inc();
    }

    pub fn record_cache_operation(&self, operation: &str, result: &str) {
        self.cache_operations
            .with_label_values(&[operation, result])
            .inc();
    }

    pub fn record_cache_operation_duration(&self, operation: &str, duration_seconds: f64) {
        self.cache_operation_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    /// Create a timer for measuring one evaluation
    pub fn start_check_timer(&self) -> prometheus::HistogramTimer {
        self.check_duration.start_timer()
    }
}

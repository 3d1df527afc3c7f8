//! HTTP admission control.
//!
//! [`RateLimitMiddleware`] evaluates every configured rule for a request and
//! decides whether it may proceed. [`RateLimitLayer`] wraps it as a tower
//! layer for axum routers.

use axum::{
    body::Body,
    response::{IntoResponse, Json},
};
use http::{header::RETRY_AFTER, HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use serde_json::json;
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::{
    cache::Cache,
    config::{HeaderOptions, LimitRule, RateLimitConfig},
    error::{RateLimitError, Result},
    manager::RateLimitManager,
    metrics::Metrics,
    request::RequestContext,
    resolver::KeyResolver,
    result::RateLimitResult,
    strategy::RateLimitStrategy,
};

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Decision for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// No active config; nothing was evaluated
    Disabled,
    /// Every rule passed; carries the most restrictive result
    Allowed(RateLimitResult),
    /// The first rule that was exceeded
    Blocked(RateLimitResult),
    /// Evaluation failed or timed out and the request is let through
    FailedOpen,
}

struct CompiledRule {
    rule: LimitRule,
    strategy: Arc<dyn RateLimitStrategy>,
    resolver: Arc<dyn KeyResolver>,
}

struct ActiveLimits {
    config: RateLimitConfig,
    rules: Vec<CompiledRule>,
    cache: Arc<dyn Cache>,
}

/// Rate limit evaluation for one route or route group
pub struct RateLimitMiddleware {
    active: Option<ActiveLimits>,
    metrics: Option<Arc<Metrics>>,
}

impl RateLimitMiddleware {
    /// Resolve every strategy, key resolver and the cache store up front so
    /// an unusable config fails here rather than per request.
    ///
    /// `None` or a config with `enabled: false` yields a pass-through
    /// middleware that never touches the cache.
    pub fn new(config: Option<RateLimitConfig>, manager: &RateLimitManager) -> Result<Self> {
        let config = match config {
            Some(config) if config.is_enabled() => config,
            _ => return Ok(Self::disabled()),
        };

        let rules = config
            .limits()
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    rule: rule.clone(),
                    strategy: manager.strategy(&rule.strategy)?,
                    resolver: manager.key_resolver(&rule.key_resolver)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let cache = manager.cache(config.cache_store())?;

        debug!(
            rules = %config.to_parameters(),
            cache_store = %config.cache_store(),
            "Rate limit middleware configured"
        );

        Ok(Self {
            active: Some(ActiveLimits {
                config,
                rules,
                cache,
            }),
            metrics: None,
        })
    }

    pub fn disabled() -> Self {
        Self {
            active: None,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.active.is_some()
    }

    pub fn config(&self) -> Option<&RateLimitConfig> {
        self.active.as_ref().map(|active| &active.config)
    }

    /// Cache keys for every rule, in rule order. Runs synchronously so the
    /// request is not held across an await point.
    pub fn resolve_keys(&self, request: &dyn RequestContext) -> Result<Vec<String>> {
        let Some(active) = &self.active else {
            return Ok(Vec::new());
        };

        active
            .rules
            .iter()
            .map(|compiled| {
                let resolved = compiled.resolver.resolve(request)?;
                Ok(compiled
                    .rule
                    .cache_key(active.config.cache_prefix(), &resolved))
            })
            .collect()
    }

    /// Check the rules in order against their resolved keys. The first
    /// exceeded rule stops evaluation.
    pub async fn evaluate(&self, keys: &[String]) -> Result<Admission> {
        let Some(active) = &self.active else {
            return Ok(Admission::Disabled);
        };
        if keys.len() != active.rules.len() {
            return Err(RateLimitError::Resolver(format!(
                "expected {} keys, got {}",
                active.rules.len(),
                keys.len()
            )));
        }

        let mut most_restrictive: Option<RateLimitResult> = None;
        for (compiled, key) in active.rules.iter().zip(keys) {
            let result = compiled
                .strategy
                .check_limit(
                    active.cache.as_ref(),
                    key,
                    compiled.rule.limit,
                    compiled.rule.window,
                )
                .await?;

            let outcome = if result.is_exceeded() {
                "exceeded"
            } else {
                "allowed"
            };
            if let Some(metrics) = &self.metrics {
                metrics.record_check(result.strategy(), outcome);
            }

            if result.is_exceeded() {
                return Ok(Admission::Blocked(result));
            }
            most_restrictive = match most_restrictive {
                Some(current) if !result.is_more_restrictive_than(&current) => Some(current),
                _ => Some(result),
            };
        }

        Ok(most_restrictive.map_or(Admission::Disabled, Admission::Allowed))
    }

    /// Full decision for a request whose keys were resolved by
    /// [`RateLimitMiddleware::resolve_keys`]. Never fails: errors and
    /// timeouts admit the request.
    pub async fn admit(&self, keys: Result<Vec<String>>) -> Admission {
        let Some(active) = &self.active else {
            return Admission::Disabled;
        };
        let _timer = self.metrics.as_ref().map(|m| m.start_check_timer());

        let keys = match keys {
            Ok(keys) => keys,
            Err(e) => return self.fail_open("error", &e),
        };

        let timeout_ms = active.config.timeout_ms();
        let evaluation =
            tokio::time::timeout(Duration::from_millis(timeout_ms), self.evaluate(&keys)).await;

        match evaluation {
            Ok(Ok(Admission::Blocked(result))) => {
                debug!(key = %result.key(), retry_after = result.retry_after(), "Rate limit exceeded");
                if let Some(metrics) = &self.metrics {
                    metrics.record_blocked(result.strategy());
                }
                Admission::Blocked(result)
            }
            Ok(Ok(admission)) => admission,
            Ok(Err(e)) => self.fail_open("error", &e),
            Err(_) => self.fail_open("timeout", &RateLimitError::Timeout(timeout_ms)),
        }
    }

    fn fail_open(&self, reason: &str, error: &RateLimitError) -> Admission {
        warn!(reason, error = %error, "Rate limit evaluation failed, admitting request");
        if let Some(metrics) = &self.metrics {
            metrics.record_fail_open(reason);
        }
        Admission::FailedOpen
    }

    fn header_options(&self) -> HeaderOptions {
        self.active
            .as_ref()
            .map(|active| active.config.headers())
            .unwrap_or_else(HeaderOptions::none)
    }

    /// Add the rate limit headers for an admitted request
    pub fn apply_headers(&self, headers: &mut HeaderMap, result: &RateLimitResult) {
        insert_rate_limit_headers(headers, result, self.header_options());
    }

    /// 429 response for a blocked request
    pub fn blocked_response(&self, result: &RateLimitResult) -> Response<Body> {
        let message = self
            .config()
            .and_then(|config| config.error_message())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "Rate limit exceeded. Try again in {} seconds.",
                    result.retry_after()
                )
            });

        let body = json!({
            "error": "Too Many Requests",
            "message": message,
            "limit": result.limit(),
            "remaining": 0,
            "reset": result.reset_time(),
            "retry_after": result.retry_after(),
        });

        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let options = self.header_options();
        insert_rate_limit_headers(response.headers_mut(), result, options);
        if options.retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(result.retry_after()));
        }
        response
    }
}

fn insert_rate_limit_headers(
    headers: &mut HeaderMap,
    result: &RateLimitResult,
    options: HeaderOptions,
) {
    if options.limit {
        headers.insert(
            HeaderName::from_static(X_RATELIMIT_LIMIT),
            HeaderValue::from(result.limit()),
        );
    }
    if options.remaining {
        headers.insert(
            HeaderName::from_static(X_RATELIMIT_REMAINING),
            HeaderValue::from(result.remaining()),
        );
    }
    if options.reset {
        headers.insert(
            HeaderName::from_static(X_RATELIMIT_RESET),
            HeaderValue::from(result.reset_time()),
        );
    }
}

/// Tower layer applying a [`RateLimitMiddleware`]
#[derive(Clone)]
pub struct RateLimitLayer {
    middleware: Arc<RateLimitMiddleware>,
}

impl RateLimitLayer {
    pub fn new(middleware: Arc<RateLimitMiddleware>) -> Self {
        Self { middleware }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            middleware: self.middleware.clone(),
        }
    }
}

/// Tower service that admits, decorates or rejects requests
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    middleware: Arc<RateLimitMiddleware>,
}

impl<S, B> Service<Request<B>> for RateLimitService<S>
where
    S: Service<Request<B>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let middleware = self.middleware.clone();
        // the clone may not be ready; keep the one poll_ready was called on
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let keys = middleware.resolve_keys(&request);

        Box::pin(async move {
            match middleware.admit(keys).await {
                Admission::Blocked(result) => Ok(middleware.blocked_response(&result)),
                Admission::Allowed(result) => {
                    let mut response = inner.call(request).await?;
                    middleware.apply_headers(response.headers_mut(), &result);
                    Ok(response)
                }
                Admission::Disabled | Admission::FailedOpen => inner.call(request).await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{request::AuthenticatedUser, utils::ManualTimeSource};

    fn manager_at(now: i64) -> (RateLimitManager, Arc<ManualTimeSource>) {
        let time = Arc::new(ManualTimeSource::new(now));
        (RateLimitManager::with_time_source(time.clone()), time)
    }

    fn middleware(rules: &str, manager: &RateLimitManager) -> RateLimitMiddleware {
        let config = RateLimitConfig::from_parameters(rules).unwrap();
        RateLimitMiddleware::new(Some(config), manager).unwrap()
    }

    fn request_from(ip: &str) -> Request<()> {
        Request::builder()
            .uri("/api/items")
            .header("x-forwarded-for", ip)
            .body(())
            .unwrap()
    }

    async fn admit(middleware: &RateLimitMiddleware, request: &Request<()>) -> Admission {
        middleware.admit(middleware.resolve_keys(request)).await
    }

    #[tokio::test]
    async fn test_disabled_passes_through() {
        let (manager, _time) = manager_at(0);
        let config = RateLimitConfig::from_parameters("1,60")
            .unwrap()
            .with_enabled(false);
        let middleware = RateLimitMiddleware::new(Some(config), &manager).unwrap();

        assert!(!middleware.is_enabled());
        assert!(middleware.resolve_keys(&request_from("1.1.1.1")).unwrap().is_empty());
        for _ in 0..5 {
            assert_eq!(
                admit(&middleware, &request_from("1.1.1.1")).await,
                Admission::Disabled
            );
        }

        let none = RateLimitMiddleware::new(None, &manager).unwrap();
        assert_eq!(admit(&none, &request_from("1.1.1.1")).await, Admission::Disabled);
    }

    #[tokio::test]
    async fn test_keys_use_prefix_and_strategy() {
        let (manager, _time) = manager_at(0);
        let config = RateLimitConfig::from_parameters("10,60|5,1,sliding,user")
            .unwrap()
            .with_cache_prefix("api");
        let middleware = RateLimitMiddleware::new(Some(config), &manager).unwrap();

        let mut request = request_from("10.1.1.1");
        request
            .extensions_mut()
            .insert(AuthenticatedUser("42".to_string()));

        assert_eq!(
            middleware.resolve_keys(&request).unwrap(),
            vec!["api:fixed:ip:10.1.1.1", "api:sliding:user:42"]
        );
    }

    #[tokio::test]
    async fn test_fixed_limit_blocks_after_limit() {
        let (manager, _time) = manager_at(1_000);
        let middleware = middleware("3,60", &manager);
        let request = request_from("10.0.0.1");

        for expected in [2u64, 1, 0] {
            match admit(&middleware, &request).await {
                Admission::Allowed(result) => assert_eq!(result.remaining(), expected),
                other => panic!("expected allowed, got {:?}", other),
            }
        }
        match admit(&middleware, &request).await {
            Admission::Blocked(result) => {
                assert_eq!(result.limit(), 3);
                assert_eq!(result.retry_after(), 20);
            }
            other => panic!("expected blocked, got {:?}", other),
        }

        // other clients keep their own quota
        assert!(matches!(
            admit(&middleware, &request_from("10.0.0.2")).await,
            Admission::Allowed(_)
        ));
    }

    #[tokio::test]
    async fn test_most_restrictive_result_wins() {
        let (manager, _time) = manager_at(0);
        let middleware = middleware("100,60|2,60,sliding", &manager);

        match admit(&middleware, &request_from("10.0.0.1")).await {
            Admission::Allowed(result) => {
                assert_eq!(result.limit(), 2);
                assert_eq!(result.remaining(), 1);
                assert_eq!(result.strategy(), "sliding");
            }
            other => panic!("expected allowed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_exceeded_rule_short_circuits() {
        let (manager, _time) = manager_at(0);
        let middleware = middleware("1,60|100,60,sliding", &manager);
        let request = request_from("10.0.0.9");

        admit(&middleware, &request).await;
        match admit(&middleware, &request).await {
            Admission::Blocked(result) => assert_eq!(result.strategy(), "fixed"),
            other => panic!("expected blocked, got {:?}", other),
        }

        // the sliding rule only saw the first request
        let sliding = manager.strategy("sliding").unwrap();
        let cache = manager.cache("default").unwrap();
        let usage = sliding
            .usage(cache.as_ref(), "rate_limit:sliding:ip:10.0.0.9", 60)
            .await
            .unwrap();
        assert_eq!(usage.count, 1);
    }

    #[tokio::test]
    async fn test_window_rollover_admits_again() {
        let (manager, time) = manager_at(0);
        let middleware = middleware("1,10", &manager);
        let request = request_from("10.0.0.3");

        assert!(matches!(admit(&middleware, &request).await, Admission::Allowed(_)));
        assert!(matches!(admit(&middleware, &request).await, Admission::Blocked(_)));
        time.advance(10);
        assert!(matches!(admit(&middleware, &request).await, Admission::Allowed(_)));
    }

    #[tokio::test]
    async fn test_resolver_error_fails_open() {
        let (manager, _time) = manager_at(0);
        let metrics = Arc::new(Metrics::new().unwrap());
        let middleware = middleware("1,60", &manager).with_metrics(metrics);

        let admission = middleware
            .admit(Err(RateLimitError::Resolver("boom".to_string())))
            .await;
        assert_eq!(admission, Admission::FailedOpen);
    }

    #[tokio::test]
    async fn test_key_count_mismatch_is_an_error() {
        let (manager, _time) = manager_at(0);
        let middleware = middleware("1,60|2,60", &manager);
        assert!(middleware.evaluate(&["only-one".to_string()]).await.is_err());
    }

    #[test]
    fn test_unknown_cache_store_fails_construction() {
        let (manager, _time) = manager_at(0);
        let config = RateLimitConfig::from_parameters("1,60")
            .unwrap()
            .with_cache_store("missing");
        let err = RateLimitMiddleware::new(Some(config), &manager).err().unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn test_blocked_response_shape() {
        let (manager, _time) = manager_at(0);
        let config = RateLimitConfig::from_parameters("5,60")
            .unwrap()
            .with_error_message("Slow down");
        let middleware = RateLimitMiddleware::new(Some(config), &manager).unwrap();

        let result = RateLimitResult::exceeded("k", "fixed", 5, 1_060, 42);
        let response = middleware.blocked_response(&result);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers[RETRY_AFTER], "42");
        assert_eq!(headers[X_RATELIMIT_LIMIT], "5");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "0");
        assert_eq!(headers[X_RATELIMIT_RESET], "1060");
    }

    #[test]
    fn test_header_options_respected() {
        let (manager, _time) = manager_at(0);
        let config = RateLimitConfig::from_parameters("5,60")
            .unwrap()
            .with_headers(HeaderOptions {
                reset: false,
                ..Default::default()
            });
        let middleware = RateLimitMiddleware::new(Some(config), &manager).unwrap();

        let mut headers = HeaderMap::new();
        middleware.apply_headers(&mut headers, &RateLimitResult::allowed("k", "fixed", 5, 4, 60));
        assert_eq!(headers[X_RATELIMIT_REMAINING], "4");
        assert!(headers.get(X_RATELIMIT_RESET).is_none());
        assert!(headers.get(RETRY_AFTER).is_none());
    }
}

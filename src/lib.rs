//! Throttle Gate
//!
//! Admission control for HTTP services. Requests are checked against one or
//! more rate limit rules, each pairing a counting strategy with a key
//! resolver, over a shared cache store (in-memory or Redis).

pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod middleware;
pub mod redis;
pub mod request;
pub mod resolver;
pub mod result;
pub mod settings;
pub mod strategy;
pub mod utils;

// Re-export main types
pub use cache::{Cache, MemoryCache};
pub use config::{LimitRule, RateLimitConfig};
pub use error::{RateLimitError, Result};
pub use manager::RateLimitManager;
pub use middleware::{Admission, RateLimitLayer, RateLimitMiddleware};
pub use request::{AuthenticatedUser, RequestContext};
pub use resolver::{KeyResolver, KeyResolverSpec};
pub use result::RateLimitResult;
pub use strategy::RateLimitStrategy;

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::{debug, info};

use crate::{
    cache::{Cache, MemoryCache},
    config::{RateLimitConfig, RawKeyResolver, RawRateLimitConfig},
    error::{RateLimitError, Result},
    resolver::{
        CompositeKeyResolver, HeaderKeyResolver, IpKeyResolver, KeyResolver, KeyResolverSpec,
        UserKeyResolver,
    },
    strategy::{
        FixedWindowStrategy, RateLimitStrategy, SlidingWindowStrategy, TokenBucketStrategy,
        FIXED_WINDOW, SLIDING_WINDOW, TOKEN_BUCKET,
    },
    utils::{SystemTimeSource, TimeSource},
};

/// Builds a strategy instance
pub type StrategyFactory = Arc<dyn Fn() -> Result<Arc<dyn RateLimitStrategy>> + Send + Sync>;

/// Builds a key resolver from its spec. For composite specs the second
/// argument holds the already built parts; it is empty otherwise.
pub type KeyResolverFactory = Arc<
    dyn Fn(&KeyResolverSpec, &[Arc<dyn KeyResolver>]) -> Result<Arc<dyn KeyResolver>>
        + Send
        + Sync,
>;

pub const DEFAULT_LOCAL_CACHE_SIZE: u64 = 100_000;

/// Separators of the rule grammar
const RESERVED_CHARS: [char; 3] = [',', '|', '+'];

/// Strategy and cache store names also reserve `:`. Resolver names may use
/// it since `custom:` is stripped once, e.g. `custom:app::resolvers::Tenant`.
const RESERVED_WITH_COLON: [char; 4] = [',', '|', '+', ':'];

/// Registry of strategies, key resolvers and cache stores.
///
/// Instances are built lazily by their factory and reused afterwards;
/// registering a name again drops the instance built by the old factory.
pub struct RateLimitManager {
    strategy_factories: RwLock<HashMap<String, StrategyFactory>>,
    strategies: RwLock<HashMap<String, Arc<dyn RateLimitStrategy>>>,
    resolver_factories: RwLock<HashMap<String, KeyResolverFactory>>,
    resolvers: RwLock<HashMap<String, Arc<dyn KeyResolver>>>,
    caches: RwLock<HashMap<String, Arc<dyn Cache>>>,
}

impl RateLimitManager {
    /// Manager with the built-in strategies, resolvers and an in-memory
    /// `default` cache store
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource))
    }

    /// Same as [`RateLimitManager::new`] with built-in strategies reading
    /// time from `time_source`
    pub fn with_time_source(time_source: Arc<dyn TimeSource>) -> Self {
        let manager = Self {
            strategy_factories: RwLock::new(HashMap::new()),
            strategies: RwLock::new(HashMap::new()),
            resolver_factories: RwLock::new(HashMap::new()),
            resolvers: RwLock::new(HashMap::new()),
            caches: RwLock::new(HashMap::new()),
        };
        manager.seed_builtins(time_source);
        manager
    }

    fn seed_builtins(&self, time_source: Arc<dyn TimeSource>) {
        let mut strategies = write(&self.strategy_factories);
        let ts = time_source.clone();
        strategies.insert(
            FIXED_WINDOW.to_string(),
            strategy_factory(move || FixedWindowStrategy::with_time_source(ts.clone())),
        );
        let ts = time_source.clone();
        strategies.insert(
            SLIDING_WINDOW.to_string(),
            strategy_factory(move || SlidingWindowStrategy::with_time_source(ts.clone())),
        );
        let ts = time_source;
        strategies.insert(
            TOKEN_BUCKET.to_string(),
            strategy_factory(move || TokenBucketStrategy::with_time_source(ts.clone())),
        );
        drop(strategies);

        let mut resolvers = write(&self.resolver_factories);
        resolvers.insert("ip".to_string(), resolver_factory(|_, _| Ok(IpKeyResolver)));
        resolvers.insert(
            "user".to_string(),
            resolver_factory(|_, _| Ok(UserKeyResolver::default())),
        );
        resolvers.insert(
            "header".to_string(),
            resolver_factory(|spec, _| {
                Ok(match spec {
                    KeyResolverSpec::Header(config) => HeaderKeyResolver::new(config.clone()),
                    _ => HeaderKeyResolver::default(),
                })
            }),
        );
        resolvers.insert(
            "composite".to_string(),
            resolver_factory(|_, parts| CompositeKeyResolver::new(parts.to_vec())),
        );
        drop(resolvers);

        write(&self.caches).insert(
            "default".to_string(),
            Arc::new(MemoryCache::new(DEFAULT_LOCAL_CACHE_SIZE)),
        );
    }

    /// Register a strategy under `name`, replacing any previous one.
    ///
    /// Names are lower-cased. The factory is invoked once here so a factory
    /// that cannot build an instance is rejected immediately.
    pub fn register_strategy(&self, name: &str, factory: StrategyFactory) -> Result<()> {
        let name = validate_name("strategy", name, &RESERVED_WITH_COLON)?.to_lowercase();
        let instance = factory()?;

        write(&self.strategy_factories).insert(name.clone(), factory);
        write(&self.strategies).insert(name.clone(), instance);

        info!(strategy = %name, "Registered rate limit strategy");
        Ok(())
    }

    /// Register a key resolver kind, replacing any previous one.
    ///
    /// The factory is probed with a parameterless spec of its kind.
    pub fn register_key_resolver(&self, name: &str, factory: KeyResolverFactory) -> Result<()> {
        let name = validate_name("key resolver", name, &RESERVED_CHARS)?.to_string();
        let probe = probe_spec(&name);
        let parts = self.composite_parts(&probe)?;
        factory(&probe, &parts)?;

        write(&self.resolver_factories).insert(name.clone(), factory);
        // composites embed other resolvers, so drop every built instance
        write(&self.resolvers).clear();

        info!(key_resolver = %name, "Registered key resolver");
        Ok(())
    }

    /// Register a named cache store, replacing any previous one
    pub fn register_cache(&self, name: &str, cache: Arc<dyn Cache>) -> Result<()> {
        let name = validate_name("cache store", name, &RESERVED_WITH_COLON)?.to_string();
        write(&self.caches).insert(name.clone(), cache);
        info!(cache_store = %name, "Registered cache store");
        Ok(())
    }

    pub fn has_strategy(&self, name: &str) -> bool {
        read(&self.strategy_factories).contains_key(name)
    }

    pub fn has_key_resolver(&self, name: &str) -> bool {
        read(&self.resolver_factories).contains_key(name)
    }

    /// Registered strategy names, sorted
    pub fn strategy_names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.strategy_factories).keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered key resolver kinds, sorted
    pub fn key_resolver_names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.resolver_factories).keys().cloned().collect();
        names.sort();
        names
    }

    /// Shared instance of the strategy registered under `name`
    pub fn strategy(&self, name: &str) -> Result<Arc<dyn RateLimitStrategy>> {
        let name = name.trim().to_lowercase();
        if let Some(strategy) = read(&self.strategies).get(&name) {
            return Ok(strategy.clone());
        }

        let factory = read(&self.strategy_factories)
            .get(&name)
            .cloned()
            .ok_or_else(|| RateLimitError::config(format!("unknown strategy '{}'", name)))?;
        let strategy = factory()?;
        debug!(strategy = %name, "Built rate limit strategy");

        Ok(write(&self.strategies)
            .entry(name)
            .or_insert(strategy)
            .clone())
    }

    /// Shared instance for a key resolver spec, building composite parts
    /// recursively
    pub fn key_resolver(&self, spec: &KeyResolverSpec) -> Result<Arc<dyn KeyResolver>> {
        spec.validate()?;
        let id = spec.cache_id();
        if let Some(resolver) = read(&self.resolvers).get(&id) {
            return Ok(resolver.clone());
        }

        let factory = read(&self.resolver_factories)
            .get(spec.kind())
            .cloned()
            .ok_or_else(|| {
                RateLimitError::config(format!("unknown key resolver '{}'", spec.kind()))
            })?;
        let parts = self.composite_parts(spec)?;
        let resolver = factory(spec, &parts)?;
        debug!(key_resolver = %spec, "Built key resolver");

        Ok(write(&self.resolvers).entry(id).or_insert(resolver).clone())
    }

    /// Key resolver from its grammar form (`ip`, `header:X-Key`, `ip+user`)
    /// or its structured form
    pub fn key_resolver_from(&self, raw: RawKeyResolver) -> Result<Arc<dyn KeyResolver>> {
        self.key_resolver(&raw.into_spec()?)
    }

    pub fn cache(&self, name: &str) -> Result<Arc<dyn Cache>> {
        read(&self.caches)
            .get(name)
            .cloned()
            .ok_or_else(|| RateLimitError::config(format!("unknown cache store '{}'", name)))
    }

    /// Parse a rule string, accepting every strategy and key resolver
    /// registered with this manager
    pub fn parse_config(&self, text: &str) -> Result<RateLimitConfig> {
        let config = RateLimitConfig::parse_with(text, |name| self.has_strategy(name))?;
        self.validate_config(&config)?;
        Ok(config)
    }

    /// Validate structured config against this manager's registries
    pub fn load_config(&self, raw: RawRateLimitConfig) -> Result<RateLimitConfig> {
        let config = raw.into_config_with(|name| self.has_strategy(name))?;
        self.validate_config(&config)?;
        Ok(config)
    }

    /// Check that every strategy, key resolver and the cache store named by
    /// `config` can be built
    pub fn validate_config(&self, config: &RateLimitConfig) -> Result<()> {
        for rule in config.limits() {
            self.strategy(&rule.strategy)?;
            self.key_resolver(&rule.key_resolver)?;
        }
        self.cache(config.cache_store())?;
        Ok(())
    }

    fn composite_parts(&self, spec: &KeyResolverSpec) -> Result<Vec<Arc<dyn KeyResolver>>> {
        match spec {
            KeyResolverSpec::Composite { resolvers } => resolvers
                .iter()
                .map(|part| self.key_resolver(part))
                .collect(),
            _ => Ok(Vec::new()),
        }
    }
}

impl Default for RateLimitManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap an infallible constructor as a [`StrategyFactory`]
pub fn strategy_factory<S, F>(build: F) -> StrategyFactory
where
    S: RateLimitStrategy + 'static,
    F: Fn() -> S + Send + Sync + 'static,
{
    Arc::new(move || -> Result<Arc<dyn RateLimitStrategy>> { Ok(Arc::new(build())) })
}

/// Wrap a typed resolver constructor as a [`KeyResolverFactory`]
pub fn resolver_factory<R, F>(build: F) -> KeyResolverFactory
where
    R: KeyResolver + 'static,
    F: Fn(&KeyResolverSpec, &[Arc<dyn KeyResolver>]) -> Result<R> + Send + Sync + 'static,
{
    Arc::new(
        move |spec: &KeyResolverSpec,
              parts: &[Arc<dyn KeyResolver>]|
              -> Result<Arc<dyn KeyResolver>> { Ok(Arc::new(build(spec, parts)?)) },
    )
}

fn validate_name<'a>(kind: &str, name: &'a str, reserved: &[char]) -> Result<&'a str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RateLimitError::config(format!("{} name must not be empty", kind)));
    }
    if name.contains(reserved) || name.contains(char::is_whitespace) {
        let listed: Vec<String> = reserved.iter().map(char::to_string).collect();
        return Err(RateLimitError::config(format!(
            "{} name '{}' must not contain whitespace or any of {}",
            kind,
            name,
            listed.join(" ")
        )));
    }
    Ok(name)
}

/// Spec used to probe a factory at registration time
fn probe_spec(name: &str) -> KeyResolverSpec {
    match name {
        "ip" => KeyResolverSpec::Ip,
        "user" => KeyResolverSpec::User,
        "header" => KeyResolverSpec::Header(Default::default()),
        "composite" => KeyResolverSpec::Composite {
            resolvers: vec![KeyResolverSpec::Ip, KeyResolverSpec::User],
        },
        other => KeyResolverSpec::Custom {
            name: other.to_string(),
            params: Default::default(),
        },
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

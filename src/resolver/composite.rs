use std::sync::Arc;

use super::KeyResolver;
use crate::{
    error::{RateLimitError, Result},
    request::RequestContext,
};

/// Joins the keys of several resolvers so quotas apply per combination,
/// e.g. per (IP, user) pair
#[derive(Clone)]
pub struct CompositeKeyResolver {
    resolvers: Vec<Arc<dyn KeyResolver>>,
}

impl CompositeKeyResolver {
    pub fn new(resolvers: Vec<Arc<dyn KeyResolver>>) -> Result<Self> {
        if resolvers.len() < 2 {
            return Err(RateLimitError::config(
                "composite key resolver needs at least two resolvers",
            ));
        }
        Ok(Self { resolvers })
    }

    pub fn parts(&self) -> Vec<&str> {
        self.resolvers.iter().map(|r| r.name()).collect()
    }
}

impl KeyResolver for CompositeKeyResolver {
    fn resolve(&self, request: &dyn RequestContext) -> Result<String> {
        let keys = self
            .resolvers
            .iter()
            .map(|resolver| resolver.resolve(request))
            .collect::<Result<Vec<_>>>()?;
        Ok(keys.join("+"))
    }

    fn name(&self) -> &str {
        "composite"
    }
}

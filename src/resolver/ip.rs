use super::KeyResolver;
use crate::{error::Result, request::RequestContext};

/// Keys requests by client IP
#[derive(Debug, Clone, Copy, Default)]
pub struct IpKeyResolver;

impl KeyResolver for IpKeyResolver {
    fn resolve(&self, request: &dyn RequestContext) -> Result<String> {
        Ok(format!("ip:{}", request.client_ip()))
    }

    fn name(&self) -> &str {
        "ip"
    }
}

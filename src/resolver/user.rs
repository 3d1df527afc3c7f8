use super::{IpKeyResolver, KeyResolver};
use crate::{error::Result, request::RequestContext};

/// Keys requests by authenticated user, throttling anonymous traffic by IP
#[derive(Debug, Clone, Copy, Default)]
pub struct UserKeyResolver {
    ip: IpKeyResolver,
}

impl KeyResolver for UserKeyResolver {
    fn resolve(&self, request: &dyn RequestContext) -> Result<String> {
        match request.user_id() {
            Some(id) => Ok(format!("user:{}", id)),
            None => self.ip.resolve(request),
        }
    }

    fn name(&self) -> &str {
        "user"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::AuthenticatedUser;
    use http::Request;

    #[test]
    fn test_authenticated_and_anonymous() {
        let mut req = Request::builder()
            .header("X-Real-IP", "192.0.2.1")
            .body(())
            .unwrap();
        let resolver = UserKeyResolver::default();
        assert_eq!(resolver.resolve(&req).unwrap(), "ip:192.0.2.1");

        req.extensions_mut().insert(AuthenticatedUser("alice".to_string()));
        assert_eq!(resolver.resolve(&req).unwrap(), "user:alice");
    }
}

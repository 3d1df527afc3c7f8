use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{IpKeyResolver, KeyResolver};
use crate::{error::Result, request::RequestContext};

pub(crate) const DEFAULT_HEADER: &str = "X-API-Key";

const AUTHORIZATION: &str = "Authorization";
const BEARER_PREFIX: &str = "bearer ";

/// Settings for [`HeaderKeyResolver`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderKeyConfig {
    /// Primary header to read
    pub header: String,
    /// Headers tried in order when the primary one is absent
    pub fallback_headers: Vec<String>,
    /// Strip `Bearer ` from values and consult `Authorization` last
    pub extract_bearer: bool,
    /// When false, values are lower-cased before use
    pub case_sensitive: bool,
    /// Replace the value by its SHA-256 hex digest
    pub hash_values: bool,
    /// Use the client IP when no header is present
    pub fallback_to_ip: bool,
}

impl Default for HeaderKeyConfig {
    fn default() -> Self {
        Self {
            header: DEFAULT_HEADER.to_string(),
            fallback_headers: Vec::new(),
            extract_bearer: false,
            case_sensitive: true,
            hash_values: false,
            fallback_to_ip: true,
        }
    }
}

impl HeaderKeyConfig {
    pub fn for_header(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            ..Default::default()
        }
    }
}

/// Keys requests by an identifying header such as an API key
#[derive(Debug, Clone, Default)]
pub struct HeaderKeyResolver {
    config: HeaderKeyConfig,
    ip: IpKeyResolver,
}

impl HeaderKeyResolver {
    pub fn new(config: HeaderKeyConfig) -> Self {
        Self {
            config,
            ip: IpKeyResolver,
        }
    }

    pub fn config(&self) -> &HeaderKeyConfig {
        &self.config
    }

    fn candidate_headers(&self) -> impl Iterator<Item = &str> {
        let authorization = self
            .config
            .extract_bearer
            .then_some(AUTHORIZATION)
            .into_iter();

        std::iter::once(self.config.header.as_str())
            .chain(self.config.fallback_headers.iter().map(String::as_str))
            .chain(authorization)
    }

    fn extract(&self, raw: &str) -> Option<String> {
        let mut value = raw.trim();
        if self.config.extract_bearer
            && value
                .get(..BEARER_PREFIX.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(BEARER_PREFIX))
        {
            value = value[BEARER_PREFIX.len()..].trim();
        }
        if value.is_empty() {
            return None;
        }

        let value = if self.config.case_sensitive {
            value.to_string()
        } else {
            value.to_lowercase()
        };

        Some(if self.config.hash_values {
            hex::encode(Sha256::digest(value.as_bytes()))
        } else {
            value
        })
    }
}

impl KeyResolver for HeaderKeyResolver {
    fn resolve(&self, request: &dyn RequestContext) -> Result<String> {
        let value = self
            .candidate_headers()
            .filter_map(|name| request.header(name))
            .find_map(|raw| self.extract(&raw));

        match value {
            Some(value) => Ok(format!("header:{}", value)),
            None if self.config.fallback_to_ip => self.ip.resolve(request),
            None => Ok("header:anonymous".to_string()),
        }
    }

    fn name(&self) -> &str {
        "header"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn request(headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().header("X-Real-IP", "198.51.100.9");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_default_header() {
        let resolver = HeaderKeyResolver::default();
        let req = request(&[("X-API-Key", "Key-123")]);
        assert_eq!(resolver.resolve(&req).unwrap(), "header:Key-123");
        assert_eq!(resolver.name(), "header");
    }

    #[test]
    fn test_fallback_headers_in_order() {
        let resolver = HeaderKeyResolver::new(HeaderKeyConfig {
            fallback_headers: vec!["X-Client-Id".to_string(), "X-Tenant".to_string()],
            ..Default::default()
        });
        let req = request(&[("X-Tenant", "acme"), ("X-Client-Id", "client-9")]);
        assert_eq!(resolver.resolve(&req).unwrap(), "header:client-9");
    }

    #[test]
    fn test_bearer_extraction() {
        let resolver = HeaderKeyResolver::new(HeaderKeyConfig {
            extract_bearer: true,
            ..Default::default()
        });
        let req = request(&[("Authorization", "Bearer tok-abc")]);
        assert_eq!(resolver.resolve(&req).unwrap(), "header:tok-abc");

        let req = request(&[("X-API-Key", "bearer inline")]);
        assert_eq!(resolver.resolve(&req).unwrap(), "header:inline");
    }

    #[test]
    fn test_case_insensitive_and_hashing() {
        let resolver = HeaderKeyResolver::new(HeaderKeyConfig {
            case_sensitive: false,
            ..Default::default()
        });
        let upper = resolver.resolve(&request(&[("X-API-Key", "ABC")])).unwrap();
        let lower = resolver.resolve(&request(&[("X-API-Key", "abc")])).unwrap();
        assert_eq!(upper, lower);

        let hashing = HeaderKeyResolver::new(HeaderKeyConfig {
            hash_values: true,
            ..Default::default()
        });
        let key = hashing.resolve(&request(&[("X-API-Key", "secret")])).unwrap();
        assert!(!key.contains("secret"));
        assert_eq!(key.len(), "header:".len() + 64);
        assert_eq!(
            key,
            hashing.resolve(&request(&[("X-API-Key", "secret")])).unwrap()
        );
    }

    #[test]
    fn test_missing_header_fallbacks() {
        let resolver = HeaderKeyResolver::default();
        assert_eq!(resolver.resolve(&request(&[])).unwrap(), "ip:198.51.100.9");

        let strict = HeaderKeyResolver::new(HeaderKeyConfig {
            fallback_to_ip: false,
            ..Default::default()
        });
        assert_eq!(strict.resolve(&request(&[])).unwrap(), "header:anonymous");
        assert_eq!(
            strict.resolve(&request(&[("X-API-Key", "   ")])).unwrap(),
            "header:anonymous"
        );
    }
}

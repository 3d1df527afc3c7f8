//! Key resolvers map an inbound request to the partition key its quota is
//! tracked under.

mod composite;
mod header;
mod ip;
mod user;

pub use composite::CompositeKeyResolver;
pub use header::{HeaderKeyConfig, HeaderKeyResolver};
pub use ip::IpKeyResolver;
pub use user::UserKeyResolver;

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

use crate::{
    error::{RateLimitError, Result},
    request::RequestContext,
};

/// Maps a request to a cache partition key
pub trait KeyResolver: Send + Sync {
    fn resolve(&self, request: &dyn RequestContext) -> Result<String>;

    fn name(&self) -> &str;
}

/// Names the rule grammar accepts without a `custom:` prefix
pub const BUILTIN_KEY_RESOLVERS: [&str; 4] = ["ip", "user", "header", "composite"];

/// Declarative description of a key resolver, either parsed from the rule
/// grammar or deserialized from `{type: ..., ...params}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyResolverSpec {
    #[default]
    Ip,
    User,
    Header(HeaderKeyConfig),
    Composite {
        resolvers: Vec<KeyResolverSpec>,
    },
    Custom {
        name: String,
        #[serde(default)]
        params: BTreeMap<String, serde_json::Value>,
    },
}

impl KeyResolverSpec {
    /// Parse the key resolver field of a rule: `ip`, `user`, `header`,
    /// `header:<Name>`, `composite`, `<a>+<b>+...` or `custom:<name>`
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RateLimitError::config("key resolver must not be empty"));
        }

        if text.contains('+') {
            let resolvers = text
                .split('+')
                .map(|part| match Self::parse(part)? {
                    KeyResolverSpec::Composite { .. } => Err(RateLimitError::config(format!(
                        "composite key resolver cannot be nested in '{}'",
                        text
                    ))),
                    spec => Ok(spec),
                })
                .collect::<Result<Vec<_>>>()?;
            return Self::composite(resolvers);
        }

        if let Some(header) = text.strip_prefix("header:") {
            let header = header.trim();
            if header.is_empty() {
                return Err(RateLimitError::config("header key resolver needs a header name"));
            }
            return Ok(KeyResolverSpec::Header(HeaderKeyConfig::for_header(header)));
        }

        if let Some(name) = text.strip_prefix("custom:") {
            let name = name.trim();
            if name.is_empty() {
                return Err(RateLimitError::config("custom key resolver needs a name"));
            }
            return Ok(KeyResolverSpec::Custom {
                name: name.to_string(),
                params: BTreeMap::new(),
            });
        }

        match text {
            "ip" => Ok(KeyResolverSpec::Ip),
            "user" => Ok(KeyResolverSpec::User),
            "header" => Ok(KeyResolverSpec::Header(HeaderKeyConfig::default())),
            "composite" => Self::composite(vec![KeyResolverSpec::Ip, KeyResolverSpec::User]),
            other => Err(RateLimitError::config(format!(
                "unknown key resolver '{}'",
                other
            ))),
        }
    }

    /// Build a composite spec, rejecting fewer than two parts
    pub fn composite(resolvers: Vec<KeyResolverSpec>) -> Result<Self> {
        let spec = KeyResolverSpec::Composite { resolvers };
        spec.validate()?;
        Ok(spec)
    }

    /// Structural checks shared by the grammar and structured config
    pub fn validate(&self) -> Result<()> {
        match self {
            KeyResolverSpec::Header(config) if config.header.trim().is_empty() => Err(
                RateLimitError::config("header key resolver needs a header name"),
            ),
            KeyResolverSpec::Composite { resolvers } => {
                if resolvers.len() < 2 {
                    return Err(RateLimitError::config(
                        "composite key resolver needs at least two resolvers",
                    ));
                }
                resolvers.iter().try_for_each(|spec| match spec {
                    KeyResolverSpec::Composite { .. } => Err(RateLimitError::config(
                        "composite key resolver cannot be nested",
                    )),
                    spec => spec.validate(),
                })
            }
            KeyResolverSpec::Custom { name, .. } if name.trim().is_empty() => {
                Err(RateLimitError::config("custom key resolver needs a name"))
            }
            _ => Ok(()),
        }
    }

    /// Registry name used to find the factory for this spec
    pub fn kind(&self) -> &str {
        match self {
            KeyResolverSpec::Ip => "ip",
            KeyResolverSpec::User => "user",
            KeyResolverSpec::Header(_) => "header",
            KeyResolverSpec::Composite { .. } => "composite",
            KeyResolverSpec::Custom { name, .. } => name,
        }
    }

    /// Identity of this spec including every parameter
    pub fn cache_id(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.to_string())
    }
}

impl fmt::Display for KeyResolverSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyResolverSpec::Ip => write!(f, "ip"),
            KeyResolverSpec::User => write!(f, "user"),
            KeyResolverSpec::Header(config) if config.header == header::DEFAULT_HEADER => {
                write!(f, "header")
            }
            KeyResolverSpec::Header(config) => write!(f, "header:{}", config.header),
            KeyResolverSpec::Composite { resolvers } => {
                let parts: Vec<String> = resolvers.iter().map(|r| r.to_string()).collect();
                write!(f, "{}", parts.join("+"))
            }
            KeyResolverSpec::Custom { name, .. } => write!(f, "custom:{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_names() {
        assert_eq!(KeyResolverSpec::parse("ip").unwrap(), KeyResolverSpec::Ip);
        assert_eq!(KeyResolverSpec::parse(" user ").unwrap(), KeyResolverSpec::User);
        assert_eq!(
            KeyResolverSpec::parse("header").unwrap(),
            KeyResolverSpec::Header(HeaderKeyConfig::default())
        );
    }

    #[test]
    fn test_parse_header_with_name() {
        match KeyResolverSpec::parse("header:X-Tenant").unwrap() {
            KeyResolverSpec::Header(config) => {
                assert_eq!(config.header, "X-Tenant");
                assert!(config.fallback_to_ip);
            }
            other => panic!("expected header spec, got {:?}", other),
        }
        assert!(KeyResolverSpec::parse("header:").is_err());
    }

    #[test]
    fn test_parse_composite() {
        let spec = KeyResolverSpec::parse("ip+user").unwrap();
        assert_eq!(
            spec,
            KeyResolverSpec::Composite {
                resolvers: vec![KeyResolverSpec::Ip, KeyResolverSpec::User]
            }
        );
        assert_eq!(KeyResolverSpec::parse("composite").unwrap(), spec);
        assert_eq!(spec.to_string(), "ip+user");

        assert!(KeyResolverSpec::parse("ip+").is_err());
        assert!(KeyResolverSpec::parse("ip+composite").is_err());
    }

    #[test]
    fn test_parse_custom_and_unknown() {
        let spec = KeyResolverSpec::parse("custom:tenant_resolver").unwrap();
        assert_eq!(spec.kind(), "tenant_resolver");
        assert_eq!(spec.to_string(), "custom:tenant_resolver");

        let err = KeyResolverSpec::parse("session").unwrap_err();
        assert!(err.is_config());
        assert!(KeyResolverSpec::parse("custom:").is_err());
    }

    #[test]
    fn test_structured_spec_deserialization() {
        let spec: KeyResolverSpec =
            serde_json::from_str(r#"{"type": "header", "header": "X-Custom-Key"}"#).unwrap();
        match &spec {
            KeyResolverSpec::Header(config) => {
                assert_eq!(config.header, "X-Custom-Key");
                assert!(!config.extract_bearer);
            }
            other => panic!("expected header spec, got {:?}", other),
        }
        assert_eq!(spec.to_string(), "header:X-Custom-Key");

        let spec: KeyResolverSpec = serde_yaml::from_str("type: user\n").unwrap();
        assert_eq!(spec, KeyResolverSpec::User);
    }

    #[test]
    fn test_cache_id_distinguishes_parameters() {
        let plain = KeyResolverSpec::parse("header:X-Key").unwrap();
        let hashed = KeyResolverSpec::Header(HeaderKeyConfig {
            hash_values: true,
            ..HeaderKeyConfig::for_header("X-Key")
        });
        assert_ne!(plain.cache_id(), hashed.cache_id());
    }
}

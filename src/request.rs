use axum::extract::ConnectInfo;
use http::Request;
use std::net::{IpAddr, SocketAddr};

/// Fallback client address when nothing else identifies the peer
pub const UNKNOWN_CLIENT_IP: &str = "127.0.0.1";

/// What the limiter needs to know about an inbound request
pub trait RequestContext {
    /// Client IP after applying the forwarded-for precedence chain
    fn client_ip(&self) -> String;

    /// Header value by case-insensitive name
    fn header(&self, name: &str) -> Option<String>;

    /// Authenticated user identifier, if an upstream layer set one
    fn user_id(&self) -> Option<String>;
}

/// Identity inserted into request extensions by an authentication layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

impl<B> RequestContext for Request<B> {
    /// Extracts the client IP in the following order:
    /// 1. X-Forwarded-For header (first IP in the list)
    /// 2. X-Real-IP header
    /// 3. ConnectInfo / SocketAddr extension
    /// 4. 127.0.0.1
    fn client_ip(&self) -> String {
        if let Some(ip) = self
            .header("x-forwarded-for")
            .and_then(|xff| xff.split(',').next().and_then(parse_ip))
        {
            return ip.to_string();
        }

        if let Some(ip) = self.header("x-real-ip").as_deref().and_then(parse_ip) {
            return ip.to_string();
        }

        if let Some(ConnectInfo(addr)) = self.extensions().get::<ConnectInfo<SocketAddr>>() {
            return addr.ip().to_string();
        }
        if let Some(addr) = self.extensions().get::<SocketAddr>() {
            return addr.ip().to_string();
        }

        UNKNOWN_CLIENT_IP.to_string()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
    }

    fn user_id(&self) -> Option<String> {
        self.extensions()
            .get::<AuthenticatedUser>()
            .map(|user| user.0.clone())
            .filter(|id| !id.is_empty())
    }
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.trim().parse::<IpAddr>().ok()
}

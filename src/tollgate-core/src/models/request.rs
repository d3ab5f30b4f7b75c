use http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::net::IpAddr;

/// Read-only view of one inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub client_ip: IpAddr,
    pub roles: Vec<String>,
    pub auth_token: Option<String>,
}

impl RequestContext {
    /// Builds a context from a method and a request target (`/path?query`).
    pub fn new(method: Method, target: &str, client_ip: IpAddr) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (target.to_string(), None),
        };
        Self { method, path, query, headers: HeaderMap::new(), client_ip, roles: Vec::new(), auth_token: None }
    }

    /// Adds a header; names are case-insensitive. Invalid names or values are skipped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(n), Ok(v)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            self.headers.insert(n, v);
        }
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

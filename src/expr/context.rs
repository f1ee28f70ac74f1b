//! Request context that expressions are evaluated against.

use std::collections::HashMap;

/// Authenticated caller identity attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Subject of the token (user or device ID)
    pub subject: String,
    /// Tenant the subject belongs to
    pub tenant: Option<String>,
    /// Plan of the tenant
    pub plan: Option<String>,
    /// Set for device tokens
    pub is_device: bool,
    /// Set for user tokens
    pub is_user: bool,
}

impl Identity {
    /// Identity of an authenticated user.
    pub fn user(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            is_user: true,
            ..Self::default()
        }
    }

    /// Identity of an authenticated device.
    pub fn device(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            is_device: true,
            ..Self::default()
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }
}

/// The request fields a rate limit decision can depend on.
///
/// This is built by the HTTP layer for every inbound request. Header names
/// are stored lowercased so lookups are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct Request {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    identity: Option<Identity>,
}

impl Request {
    /// Create a request context. Any query string is stripped from `path`.
    pub fn new(method: impl AsRef<str>, path: impl AsRef<str>) -> Self {
        let path = path.as_ref();
        let path = path.split_once('?').map_or(path, |(p, _)| p);
        Self {
            method: method.as_ref().to_ascii_uppercase(),
            path: path.to_string(),
            headers: HashMap::new(),
            identity: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Look up a header value, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_normalizes_method_and_path() {
        let req = Request::new("get", "/api/devices?page=2");
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/api/devices");
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let req = Request::new("GET", "/").with_header("X-Forwarded-For", "10.0.0.1");
        assert_eq!(req.header("x-forwarded-for"), Some("10.0.0.1"));
        assert_eq!(req.header("X-FORWARDED-FOR"), Some("10.0.0.1"));
        assert_eq!(req.header("user-agent"), None);
    }

    #[test]
    fn test_identity_builders() {
        let id = Identity::device("dev-1").with_tenant("t1").with_plan("enterprise");
        assert!(id.is_device);
        assert!(!id.is_user);
        assert_eq!(id.tenant.as_deref(), Some("t1"));
        assert_eq!(id.plan.as_deref(), Some("enterprise"));
    }
}

//! Pluggable user identification

use http::HeaderMap;

/// Extracts an opaque user identity from a request
///
/// `None` means the caller is anonymous; jobs created anonymously are
/// visible to everyone.
pub trait UserIdentifier: Send + Sync {
    fn identify(&self, headers: &HeaderMap) -> Option<String>;
}

/// Treats every caller as anonymous
pub struct AnonymousIdentifier;

impl UserIdentifier for AnonymousIdentifier {
    fn identify(&self, _headers: &HeaderMap) -> Option<String> {
        None
    }
}

/// Reads the identity from a trusted request header, the way a fronting
/// auth proxy would supply it
pub struct HeaderIdentifier {
    header: String,
}

impl HeaderIdentifier {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl UserIdentifier for HeaderIdentifier {
    fn identify(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(&self.header)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

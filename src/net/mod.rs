//! # Network Stack
//!
//! The HTTP/3-first client stack: shared request/response types, the
//! caching DNS resolver, the profile-scoring network optimizer, the QUIC
//! connection engine with congestion control and multipath scheduling.
//!
//! The stack is a protocol engine: TLS cryptographic primitives and the
//! UDP syscall layer are external collaborators reached through the
//! interface contracts here, which keeps every state machine fully
//! drivable from tests.

use serde::{Deserialize, Serialize};
use url::Url;

pub mod congestion;
pub mod dns;
pub mod fetch;
pub mod http3;
pub mod multipath;
pub mod optimizer;

/// HTTP request methods understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    Propfind,
}

impl Method {
    /// Idempotent methods are the only ones permitted in 0-RTT early
    /// data, since an attacker can replay the first flight.
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            Method::Get | Method::Head | Method::Options | Method::Propfind
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Propfind => "PROPFIND",
        }
    }
}

/// Ordered header list; duplicate names are legal and order-preserving.
pub type Headers = Vec<(String, String)>;

/// Look up the first header with `name`, case-insensitively.
pub fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// A request as seen by the shield and the HTTP/3 client.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: Url,
    pub method: Method,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::Get,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A complete response delivered to the embedding host.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Final URL, after any rewrite by the shield.
    pub url: Url,
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Set when the shield neutralized the request; the body is empty and
    /// the status is 200 so page scripts keep working.
    pub blocked: bool,
    /// Set when a cached body is being served while revalidation runs.
    pub stale: bool,
}

impl HttpResponse {
    /// The successful empty-body response substituted for a blocked
    /// tracker request.
    pub fn blocked_sink(url: Url) -> Self {
        Self {
            url,
            status: 200,
            headers: vec![("content-length".into(), "0".into())],
            body: Vec::new(),
            blocked: true,
            stale: false,
        }
    }
}

/// One pinned HSTS host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HstsEntry {
    pub host: String,
    pub include_subdomains: bool,
    /// Expiry, nanoseconds since the Unix epoch.
    pub expires_ns: u64,
}

/// In-memory HSTS list, persisted as a blob across sessions.
#[derive(Default)]
pub struct HstsStore {
    entries: dashmap::DashMap<String, HstsEntry>,
}

impl HstsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a Strict-Transport-Security pin.
    pub fn upsert(&self, host: &str, include_subdomains: bool, max_age_secs: u64) {
        let entry = HstsEntry {
            host: host.to_string(),
            include_subdomains,
            expires_ns: crate::now_unix_ns() + max_age_secs.saturating_mul(1_000_000_000),
        };
        self.entries.insert(host.to_string(), entry);
    }

    /// Whether requests to `host` must be upgraded to https.
    pub fn requires_https(&self, host: &str) -> bool {
        let now = crate::now_unix_ns();
        if let Some(entry) = self.entries.get(host) {
            if entry.expires_ns > now {
                return true;
            }
        }
        // Walk parent domains for include-subdomains pins.
        let mut rest = host;
        while let Some((_, parent)) = rest.split_once('.') {
            if let Some(entry) = self.entries.get(parent) {
                if entry.include_subdomains && entry.expires_ns > now {
                    return true;
                }
            }
            rest = parent;
        }
        false
    }

    pub fn snapshot(&self) -> Vec<HstsEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn restore(&self, entries: Vec<HstsEntry>) {
        let now = crate::now_unix_ns();
        for entry in entries {
            if entry.expires_ns > now {
                self.entries.insert(entry.host.clone(), entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hsts_pins_apply_to_subdomains_when_asked() {
        let store = HstsStore::new();
        store.upsert("secure.test", true, 3600);
        store.upsert("exact.test", false, 3600);

        assert!(store.requires_https("secure.test"));
        assert!(store.requires_https("api.secure.test"));
        assert!(store.requires_https("exact.test"));
        assert!(!store.requires_https("api.exact.test"));
        assert!(!store.requires_https("other.test"));
    }

    #[test]
    fn idempotent_set_is_exactly_the_early_data_set() {
        for method in [Method::Get, Method::Head, Method::Options, Method::Propfind] {
            assert!(method.is_idempotent());
        }
        for method in [Method::Post, Method::Put, Method::Delete, Method::Patch] {
            assert!(!method.is_idempotent());
        }
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let headers = vec![("Content-Type".to_string(), "text/html".to_string())];
        assert_eq!(header(&headers, "content-type"), Some("text/html"));
        assert_eq!(header(&headers, "x-missing"), None);
    }
}

//! Cookie policy decisions and the partitioned cookie jar.
//!
//! Decision ladder for every cookie, in order:
//!
//! 1. exempt top-level origin → allow (lifetime still trimmed);
//! 2. third-party cookie under a restrictive policy → block, partition,
//!    or session-limit per the policy, with exempt cookie domains
//!    downgraded from block to partition;
//! 3. tracking-suspect (known cookie name, tracker-owned domain, or a
//!    long high-entropy value) → block;
//! 4. otherwise allow, trimming the expiry to the policy maximum.
//!
//! Partitioned cookies are stored under a jar scoped to the top-level
//! site, with the cookie name prefixed by the sanitized top-level
//! domain, so two sites embedding the same third party see disjoint
//! cookies.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::privacy::trackers::TrackerRegistry;
use crate::privacy::{ShieldPolicy, ThirdPartyCookiePolicy};

/// SameSite attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    None,
    Lax,
    Strict,
}

/// Attributes carried by a Set-Cookie header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieFlags {
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
    pub path: String,
    /// Absolute expiry, seconds since the Unix epoch; `None` means a
    /// session cookie.
    pub expires_unix: Option<u64>,
}

impl Default for CookieFlags {
    fn default() -> Self {
        Self {
            secure: false,
            http_only: false,
            same_site: SameSite::Lax,
            path: "/".to_string(),
            expires_unix: None,
        }
    }
}

/// Outcome of the decision ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CookieDecision {
    Allow,
    Block,
    /// Store in the top-level site's partitioned jar.
    Partition,
    /// Allow with the lifetime trimmed to the policy maximum.
    Modify,
    /// Allow, but drop at end of session.
    SessionOnly,
}

/// Registrable-domain approximation: the last two labels of a host.
///
/// Good enough for policy decisions without a public-suffix list, which
/// the embedding host may substitute.
pub fn site_of(host: &str) -> String {
    let labels: Vec<&str> = host.rsplitn(3, '.').collect();
    if labels.len() >= 2 {
        format!("{}.{}", labels[1], labels[0])
    } else {
        host.to_string()
    }
}

/// Whether `cookie_domain` is third-party relative to the top-level page.
pub fn is_third_party(top_level: &Url, cookie_domain: &str) -> bool {
    let Some(top_host) = top_level.host_str() else {
        return true;
    };
    site_of(top_host) != site_of(cookie_domain.trim_start_matches('.'))
}

/// Cookie names that exist to identify users across sites.
const SUSPECT_NAME_PREFIXES: &[&str] = &[
    "_ga",
    "_gid",
    "_gat",
    "_fbp",
    "_fbc",
    "__utm",
    "_hj",
    "_pk_id",
    "__qca",
    "ajs_anonymous_id",
    "amplitude_id",
    "mixpanel",
];

/// Minimum length before value entropy is considered at all.
const ENTROPY_MIN_LEN: usize = 32;
/// Shannon entropy (bits per byte) above which a long value looks like a
/// generated identifier.
const ENTROPY_THRESHOLD: f64 = 4.2;

fn shannon_entropy(value: &str) -> f64 {
    if value.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for byte in value.bytes() {
        counts[byte as usize] += 1;
    }
    let len = value.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Whether (name, value, domain) pattern-matches a tracking identifier.
pub fn is_tracking_suspect(registry: &TrackerRegistry, domain: &str, name: &str, value: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    if SUSPECT_NAME_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
    {
        return true;
    }
    if registry.is_tracker_domain(domain.trim_start_matches('.')) {
        return true;
    }
    value.len() >= ENTROPY_MIN_LEN && shannon_entropy(value) > ENTROPY_THRESHOLD
}

/// Run the decision ladder for one cookie.
pub fn decide(
    policy: &ShieldPolicy,
    registry: &TrackerRegistry,
    top_level: &Url,
    cookie_domain: &str,
    name: &str,
    value: &str,
    flags: &CookieFlags,
) -> CookieDecision {
    let top_host = top_level.host_str().unwrap_or_default();
    let exceeds_lifetime = flags
        .expires_unix
        .map(|expiry| {
            let now_secs = crate::now_unix_ns() / 1_000_000_000;
            expiry.saturating_sub(now_secs) > policy.max_cookie_lifetime_secs
        })
        .unwrap_or(false);

    if policy.is_exempt(top_host) {
        return if exceeds_lifetime {
            CookieDecision::Modify
        } else {
            CookieDecision::Allow
        };
    }

    if is_third_party(top_level, cookie_domain) {
        match policy.third_party_cookies {
            ThirdPartyCookiePolicy::Blocked => {
                let domain_exempt = policy.is_exempt(cookie_domain.trim_start_matches('.'));
                return if domain_exempt {
                    CookieDecision::Partition
                } else {
                    CookieDecision::Block
                };
            }
            ThirdPartyCookiePolicy::Partitioned => return CookieDecision::Partition,
            ThirdPartyCookiePolicy::SessionOnly => return CookieDecision::SessionOnly,
            ThirdPartyCookiePolicy::Allowed => {}
        }
    }

    if is_tracking_suspect(registry, cookie_domain, name, value) {
        return CookieDecision::Block;
    }

    if exceeds_lifetime {
        CookieDecision::Modify
    } else {
        CookieDecision::Allow
    }
}

/// Sanitized top-level-site prefix that scopes a partitioned cookie.
pub fn partition_prefix(top_level_host: &str) -> String {
    let sanitized: String = site_of(top_level_host)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("__ptn_{sanitized}_")
}

#[derive(Debug, Clone)]
struct StoredCookie {
    /// Name as stored, prefix included for partitioned cookies.
    stored_name: String,
    /// Name as sent on the wire.
    name: String,
    value: String,
    domain: String,
    session_only: bool,
    expires_unix: Option<u64>,
}

/// Cookie storage: one global jar plus one jar per partitioning
/// top-level site.
pub struct CookieJar {
    /// (jar key, domain, stored name) → cookie. Jar key "" is global.
    cookies: DashMap<(String, String, String), StoredCookie>,
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieJar {
    pub fn new() -> Self {
        Self {
            cookies: DashMap::new(),
        }
    }

    /// Apply a decision, storing the cookie in the right jar (or not at
    /// all).
    pub fn store(
        &self,
        decision: CookieDecision,
        top_level: &Url,
        cookie_domain: &str,
        name: &str,
        value: &str,
        flags: &CookieFlags,
        max_lifetime_secs: u64,
    ) {
        let domain = cookie_domain.trim_start_matches('.').to_string();
        let now_secs = crate::now_unix_ns() / 1_000_000_000;
        match decision {
            CookieDecision::Block => {}
            CookieDecision::Allow => {
                self.insert("", &domain, name, name, value, false, flags.expires_unix);
            }
            CookieDecision::SessionOnly => {
                self.insert("", &domain, name, name, value, true, None);
            }
            CookieDecision::Modify => {
                let trimmed = Some(now_secs + max_lifetime_secs);
                self.insert("", &domain, name, name, value, false, trimmed);
            }
            CookieDecision::Partition => {
                let top_host = top_level.host_str().unwrap_or_default();
                let jar_key = site_of(top_host);
                let stored_name = format!("{}{name}", partition_prefix(top_host));
                self.insert(
                    &jar_key,
                    &domain,
                    &stored_name,
                    name,
                    value,
                    false,
                    flags.expires_unix,
                );
            }
        }
    }

    /// Cookies to attach to a request from page `top_level` to
    /// `request_domain`: the global jar plus the page's partition.
    pub fn cookies_for(&self, top_level: &Url, request_domain: &str) -> Vec<(String, String)> {
        let jar_key = top_level.host_str().map(site_of).unwrap_or_default();
        let now_secs = crate::now_unix_ns() / 1_000_000_000;
        let request_site = site_of(request_domain);
        self.cookies
            .iter()
            .filter(|entry| {
                let (key, domain, _) = entry.key();
                (key.is_empty() || *key == jar_key) && site_of(domain) == request_site
            })
            .filter(|entry| {
                entry
                    .value()
                    .expires_unix
                    .map(|expiry| expiry > now_secs)
                    .unwrap_or(true)
            })
            .map(|entry| (entry.value().name.clone(), entry.value().value.clone()))
            .collect()
    }

    /// Stored (prefixed) names inside one top-level site's partition.
    pub fn partitioned_names(&self, top_level: &Url) -> Vec<String> {
        let jar_key = top_level.host_str().map(site_of).unwrap_or_default();
        self.cookies
            .iter()
            .filter(|entry| entry.key().0 == jar_key)
            .map(|entry| entry.value().stored_name.clone())
            .collect()
    }

    /// Drop session-only cookies; called on orderly shutdown.
    pub fn end_session(&self) {
        self.cookies.retain(|_, cookie| !cookie.session_only);
    }

    /// Total stored cookies, across all jars.
    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Whether any jar holds a cookie with this wire name for `domain`.
    pub fn contains(&self, domain: &str, name: &str) -> bool {
        self.cookies
            .iter()
            .any(|e| e.value().domain == domain && e.value().name == name)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert(
        &self,
        jar_key: &str,
        domain: &str,
        stored_name: &str,
        name: &str,
        value: &str,
        session_only: bool,
        expires_unix: Option<u64>,
    ) {
        self.cookies.insert(
            (
                jar_key.to_string(),
                domain.to_string(),
                stored_name.to_string(),
            ),
            StoredCookie {
                stored_name: stored_name.to_string(),
                name: name.to_string(),
                value: value.to_string(),
                domain: domain.to_string(),
                session_only,
                expires_unix,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PrivacyConfig, Severity};

    fn policy(cookie_severity: Severity) -> ShieldPolicy {
        ShieldPolicy::from_config(&PrivacyConfig {
            tracker_severity: Severity::Standard,
            cookie_severity,
            fingerprint_severity: Severity::Standard,
            disable_zero_rtt: false,
        })
    }

    #[test]
    fn first_party_cookies_are_allowed() {
        let policy = policy(Severity::Strict);
        let registry = TrackerRegistry::new();
        let top = Url::parse("https://shop.test/").unwrap();
        let decision = decide(
            &policy,
            &registry,
            &top,
            "shop.test",
            "cart",
            "3-items",
            &CookieFlags::default(),
        );
        assert_eq!(decision, CookieDecision::Allow);
    }

    #[test]
    fn strict_severity_partitions_third_party_cookies() {
        let policy = policy(Severity::Strict);
        let registry = TrackerRegistry::new();
        let top = Url::parse("https://a.test/").unwrap();
        let decision = decide(
            &policy,
            &registry,
            &top,
            "cdn.test",
            "sid",
            "abc",
            &CookieFlags::default(),
        );
        assert_eq!(decision, CookieDecision::Partition);
    }

    #[test]
    fn aggressive_blocks_unless_domain_exempt() {
        let mut policy = policy(Severity::Aggressive);
        let registry = TrackerRegistry::new();
        let top = Url::parse("https://a.test/").unwrap();
        let decision = decide(
            &policy,
            &registry,
            &top,
            "cdn.test",
            "sid",
            "abc",
            &CookieFlags::default(),
        );
        assert_eq!(decision, CookieDecision::Block);

        policy.exempt("cdn.test");
        let decision = decide(
            &policy,
            &registry,
            &top,
            "cdn.test",
            "sid",
            "abc",
            &CookieFlags::default(),
        );
        assert_eq!(decision, CookieDecision::Partition);
    }

    #[test]
    fn known_tracking_names_are_blocked() {
        let policy = policy(Severity::Mild);
        let registry = TrackerRegistry::new();
        let top = Url::parse("https://shop.test/").unwrap();
        let decision = decide(
            &policy,
            &registry,
            &top,
            "shop.test",
            "_ga",
            "GA1.2.12345.67890",
            &CookieFlags::default(),
        );
        assert_eq!(decision, CookieDecision::Block);
    }

    #[test]
    fn long_high_entropy_values_are_blocked() {
        let policy = policy(Severity::Mild);
        let registry = TrackerRegistry::new();
        let top = Url::parse("https://shop.test/").unwrap();
        let generated = "qX8vR2mKpL9wNzT4hYbG6cJdF1sAeU3oWiQ7xMnBvCkE";
        let decision = decide(
            &policy,
            &registry,
            &top,
            "shop.test",
            "pref",
            generated,
            &CookieFlags::default(),
        );
        assert_eq!(decision, CookieDecision::Block);

        // Short or low-entropy values pass.
        let decision = decide(
            &policy,
            &registry,
            &top,
            "shop.test",
            "pref",
            "dark-mode",
            &CookieFlags::default(),
        );
        assert_eq!(decision, CookieDecision::Allow);
    }

    #[test]
    fn oversized_lifetimes_are_trimmed() {
        let policy = policy(Severity::Strict);
        let registry = TrackerRegistry::new();
        let top = Url::parse("https://shop.test/").unwrap();
        let now_secs = crate::now_unix_ns() / 1_000_000_000;
        let flags = CookieFlags {
            expires_unix: Some(now_secs + 365 * 24 * 3600),
            ..Default::default()
        };
        let decision = decide(&policy, &registry, &top, "shop.test", "cart", "x", &flags);
        assert_eq!(decision, CookieDecision::Modify);
    }

    #[test]
    fn partitioned_jars_are_disjoint_per_top_level_site() {
        let jar = CookieJar::new();
        let flags = CookieFlags::default();
        let a = Url::parse("https://a.test/").unwrap();
        let b = Url::parse("https://b.test/").unwrap();

        // cdn.test sets sid=abc while embedded in a.test only.
        jar.store(CookieDecision::Partition, &a, "cdn.test", "sid", "abc", &flags, 3600);

        let from_a = jar.cookies_for(&a, "cdn.test");
        assert_eq!(from_a, vec![("sid".to_string(), "abc".to_string())]);
        let from_b = jar.cookies_for(&b, "cdn.test");
        assert!(from_b.is_empty());

        // The stored name is scoped by the sanitized top-level prefix.
        let stored = jar.partitioned_names(&a);
        assert_eq!(stored, vec!["__ptn_a_test_sid".to_string()]);

        // The same third party on b.test gets its own value.
        jar.store(CookieDecision::Partition, &b, "cdn.test", "sid", "xyz", &flags, 3600);
        let from_b = jar.cookies_for(&b, "cdn.test");
        assert_eq!(from_b, vec![("sid".to_string(), "xyz".to_string())]);
        let from_a = jar.cookies_for(&a, "cdn.test");
        assert_eq!(from_a, vec![("sid".to_string(), "abc".to_string())]);
    }

    #[test]
    fn session_cookies_vanish_at_session_end() {
        let jar = CookieJar::new();
        let top = Url::parse("https://a.test/").unwrap();
        jar.store(
            CookieDecision::SessionOnly,
            &top,
            "cdn.test",
            "tmp",
            "1",
            &CookieFlags::default(),
            3600,
        );
        assert!(jar.contains("cdn.test", "tmp"));
        jar.end_session();
        assert!(!jar.contains("cdn.test", "tmp"));
    }

    #[test]
    fn site_of_collapses_subdomains() {
        assert_eq!(site_of("deep.cdn.metrics.test"), "metrics.test");
        assert_eq!(site_of("a.test"), "a.test");
        assert_eq!(site_of("localhost"), "localhost");
    }
}

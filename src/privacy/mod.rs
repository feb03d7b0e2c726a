//! # Privacy Shield
//!
//! Classifies and rewrites requests, cookies, ICE candidates, and
//! fingerprint surfaces according to a per-site policy model.
//!
//! ## Severity Model
//!
//! One of four severity levels (mild, standard, strict, aggressive)
//! drives every default: the third-party cookie policy, the strategy
//! applied to unknown trackers, the WebRTC ICE candidate policy, and the
//! set of fingerprint vectors that get attenuated. Site exemptions and
//! custom rules refine the defaults per origin.
//!
//! ## Audit Trail
//!
//! Policy denials are not errors: a blocked tracker produces a
//! successful empty-body response flagged `blocked`, and every denial is
//! logged on the `audit` target with the tracker and page key, feeding
//! the per-site block statistics.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::config::{PrivacyConfig, Severity};
use crate::net::HttpRequest;

pub mod cookies;
pub mod fingerprint;
pub mod ml;
pub mod trackers;
pub mod webrtc;

pub use cookies::{CookieDecision, CookieFlags, CookieJar};
pub use fingerprint::{FingerprintConfig, FingerprintDefense};
pub use trackers::{BlockStrategy, TrackerCategory, TrackerDefinition, TrackerRegistry};
pub use webrtc::{IceCandidate, IcePolicy, IceSanitizer};

/// Third-party cookie handling selected by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThirdPartyCookiePolicy {
    Allowed,
    /// Kept, but only until the session ends.
    SessionOnly,
    /// Scoped into a per-top-level-site jar.
    Partitioned,
    Blocked,
}

/// The effective shield policy, derived once from configuration and held
/// by the supervisor; subsystems receive it explicitly.
#[derive(Debug, Clone)]
pub struct ShieldPolicy {
    pub tracker_severity: Severity,
    pub cookie_severity: Severity,
    pub fingerprint_severity: Severity,
    pub third_party_cookies: ThirdPartyCookiePolicy,
    /// Strategy applied when only the ML classifier flags a request.
    pub unknown_tracker_strategy: BlockStrategy,
    pub ice_policy: IcePolicy,
    /// Drop ICE candidates using TCP, whatever their type.
    pub disable_ice_tcp: bool,
    /// Drop ICE candidates using UDP, whatever their type.
    pub disable_ice_udp: bool,
    /// Top-level origins exempt from blocking and partitioning.
    pub exempt_domains: HashSet<String>,
    /// Cookie lifetimes are clamped to this many seconds.
    pub max_cookie_lifetime_secs: u64,
}

impl ShieldPolicy {
    /// Derive the full policy from configured severities.
    pub fn from_config(config: &PrivacyConfig) -> Self {
        let third_party_cookies = match config.cookie_severity {
            Severity::Mild => ThirdPartyCookiePolicy::Allowed,
            Severity::Standard => ThirdPartyCookiePolicy::SessionOnly,
            Severity::Strict => ThirdPartyCookiePolicy::Partitioned,
            Severity::Aggressive => ThirdPartyCookiePolicy::Blocked,
        };
        let unknown_tracker_strategy = match config.tracker_severity {
            Severity::Mild => BlockStrategy::None,
            Severity::Standard => BlockStrategy::Cookie,
            Severity::Strict => BlockStrategy::ResourceAndCookie,
            Severity::Aggressive => BlockStrategy::ResourceAndCookie,
        };
        let ice_policy = match config.tracker_severity {
            Severity::Mild => IcePolicy::All,
            Severity::Standard => IcePolicy::Default,
            Severity::Strict => IcePolicy::MdnsOnly,
            Severity::Aggressive => IcePolicy::RelayOnly,
        };
        // TCP candidates sidestep UDP-level protections and are rare in
        // legitimate calls; the stricter levels drop them outright.
        let disable_ice_tcp = matches!(
            config.tracker_severity,
            Severity::Strict | Severity::Aggressive
        );
        let max_cookie_lifetime_secs = match config.cookie_severity {
            Severity::Mild => 400 * 24 * 3600,
            Severity::Standard => 180 * 24 * 3600,
            Severity::Strict => 30 * 24 * 3600,
            Severity::Aggressive => 7 * 24 * 3600,
        };
        Self {
            tracker_severity: config.tracker_severity,
            cookie_severity: config.cookie_severity,
            fingerprint_severity: config.fingerprint_severity,
            third_party_cookies,
            unknown_tracker_strategy,
            ice_policy,
            disable_ice_tcp,
            disable_ice_udp: false,
            exempt_domains: HashSet::new(),
            max_cookie_lifetime_secs,
        }
    }

    pub fn exempt(&mut self, domain: impl Into<String>) {
        self.exempt_domains.insert(domain.into());
    }

    pub fn is_exempt(&self, host: &str) -> bool {
        self.exempt_domains
            .iter()
            .any(|d| host == d || host.ends_with(&format!(".{d}")))
    }
}

/// Per-(tracker, page) block counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockStatistics {
    /// (tracker domain, page key) → blocked request count.
    pub blocked: Vec<(String, String, u64)>,
    pub total_blocked: u64,
    pub total_cookies_refused: u64,
}

/// The shield facade: one instance per engine core.
pub struct PrivacyShield {
    policy: ShieldPolicy,
    registry: TrackerRegistry,
    jar: CookieJar,
    ice: IceSanitizer,
    fingerprint: FingerprintDefense,
    classifier: Option<Arc<dyn ml::TrackerClassifier>>,
    block_counts: DashMap<(String, String), u64>,
    cookies_refused: DashMap<String, u64>,
}

impl PrivacyShield {
    pub fn new(policy: ShieldPolicy) -> Arc<Self> {
        let fingerprint = FingerprintDefense::new(policy.fingerprint_severity);
        let mut ice = IceSanitizer::new(policy.ice_policy);
        ice.disable_tcp = policy.disable_ice_tcp;
        ice.disable_udp = policy.disable_ice_udp;
        Arc::new(Self {
            policy,
            registry: TrackerRegistry::with_builtin_catalog(),
            jar: CookieJar::new(),
            ice,
            fingerprint,
            classifier: None,
            block_counts: DashMap::new(),
            cookies_refused: DashMap::new(),
        })
    }

    /// Attach the optional ML classifier.
    ///
    /// The ML path is strictly additive: it can only flag requests the
    /// rule set did not, never weaken a rule decision.
    pub fn with_classifier(policy: ShieldPolicy, classifier: Arc<dyn ml::TrackerClassifier>) -> Arc<Self> {
        let fingerprint = FingerprintDefense::new(policy.fingerprint_severity);
        let mut ice = IceSanitizer::new(policy.ice_policy);
        ice.disable_tcp = policy.disable_ice_tcp;
        ice.disable_udp = policy.disable_ice_udp;
        Arc::new(Self {
            policy,
            registry: TrackerRegistry::with_builtin_catalog(),
            jar: CookieJar::new(),
            ice,
            fingerprint,
            classifier: Some(classifier),
            block_counts: DashMap::new(),
            cookies_refused: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &TrackerRegistry {
        &self.registry
    }

    pub fn jar(&self) -> &CookieJar {
        &self.jar
    }

    pub fn policy(&self) -> &ShieldPolicy {
        &self.policy
    }

    /// Should the resource request be neutralized entirely?
    pub fn should_block(&self, request_url: &Url, source_origin: &Url) -> bool {
        let page_host = source_origin.host_str().unwrap_or_default();
        if self.policy.is_exempt(page_host) {
            return false;
        }

        let strategy = self.effective_strategy(request_url, source_origin);
        matches!(
            strategy,
            BlockStrategy::Resource | BlockStrategy::ResourceAndCookie
        )
    }

    /// Apply the shield to an outgoing request.
    ///
    /// A blocked request is rewritten to the empty-body sink; a
    /// modify-request strategy strips tracking parameters and the
    /// referrer header instead.
    pub fn modify_request(&self, mut request: HttpRequest, source_origin: &Url) -> HttpRequest {
        let tracker_host = request.url.host_str().unwrap_or_default().to_string();
        let page_key = source_origin.host_str().unwrap_or_default().to_string();

        if self.should_block(&request.url, source_origin) {
            self.record_block(&tracker_host, &page_key);
            info!(
                target: "audit",
                tracker = %tracker_host,
                page = %page_key,
                "blocked tracker request"
            );
            request.url = Url::parse("about:blank").expect("static url parses");
            request.headers.clear();
            request.body = None;
            return request;
        }

        if self.effective_strategy(&request.url, source_origin) == BlockStrategy::ModifyRequest {
            let before = request.url.clone();
            request.url = trackers::strip_tracking_params(&request.url);
            request
                .headers
                .retain(|(name, _)| !name.eq_ignore_ascii_case("referer"));
            if before != request.url {
                debug!(
                    target: "audit",
                    url = %request.url,
                    "stripped tracking parameters from request"
                );
            }
        }
        request
    }

    /// Decide one cookie. See [`cookies`] for the decision ladder.
    pub fn process_cookie(
        &self,
        top_level: &Url,
        cookie_domain: &str,
        name: &str,
        value: &str,
        flags: &CookieFlags,
    ) -> CookieDecision {
        let decision = cookies::decide(
            &self.policy,
            &self.registry,
            top_level,
            cookie_domain,
            name,
            value,
            flags,
        );
        if decision == CookieDecision::Block {
            let host = top_level.host_str().unwrap_or_default().to_string();
            *self.cookies_refused.entry(host.clone()).or_insert(0) += 1;
            info!(
                target: "audit",
                cookie = name,
                domain = cookie_domain,
                page = %host,
                "refused cookie"
            );
        }
        decision
    }

    /// Sanitize a set of ICE candidates under the active policy.
    pub fn sanitize_ice_candidates(&self, candidates: &[String]) -> Vec<String> {
        self.ice.sanitize(candidates)
    }

    /// Fingerprint attenuation settings for `domain`.
    pub fn evaluate_fingerprint_config(&self, domain: &str) -> FingerprintConfig {
        self.fingerprint.evaluate(domain)
    }

    /// Snapshot of the per-site block statistics, for the audit surface
    /// and persistence.
    pub fn block_statistics(&self) -> BlockStatistics {
        let blocked: Vec<(String, String, u64)> = self
            .block_counts
            .iter()
            .map(|e| (e.key().0.clone(), e.key().1.clone(), *e.value()))
            .collect();
        BlockStatistics {
            total_blocked: blocked.iter().map(|(_, _, n)| n).sum(),
            total_cookies_refused: self.cookies_refused.iter().map(|e| *e.value()).sum(),
            blocked,
        }
    }

    /// Blocked count for one (tracker, page) pair.
    pub fn blocked_count(&self, tracker_domain: &str, page_key: &str) -> u64 {
        self.block_counts
            .get(&(tracker_domain.to_string(), page_key.to_string()))
            .map(|e| *e.value())
            .unwrap_or(0)
    }

    /// Seed block statistics from persisted state.
    pub fn restore_statistics(&self, stats: BlockStatistics) {
        for (tracker, page, count) in stats.blocked {
            self.block_counts.insert((tracker, page), count);
        }
    }

    fn record_block(&self, tracker_host: &str, page_key: &str) {
        *self
            .block_counts
            .entry((tracker_host.to_string(), page_key.to_string()))
            .or_insert(0) += 1;
    }

    /// Rule strategy for the request, with the ML path strictly additive:
    /// when no rule matches, a confident classifier verdict applies the
    /// policy's unknown-tracker strategy.
    fn effective_strategy(&self, request_url: &Url, source_origin: &Url) -> BlockStrategy {
        if let Some(strategy) = self.registry.match_strategy(request_url) {
            return strategy;
        }
        if let Some(classifier) = &self.classifier {
            let features = ml::FeatureVector::from_request(request_url, source_origin);
            let probability = classifier.probability(&features);
            if probability > ml::CONFIDENCE_THRESHOLD {
                debug!(
                    target: "audit",
                    url = %request_url,
                    probability = format!("{probability:.2}"),
                    "classifier flagged request as tracker"
                );
                return self.policy.unknown_tracker_strategy;
            }
        }
        BlockStrategy::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(tracker: Severity, cookie: Severity) -> ShieldPolicy {
        ShieldPolicy::from_config(&PrivacyConfig {
            tracker_severity: tracker,
            cookie_severity: cookie,
            fingerprint_severity: Severity::Standard,
            disable_zero_rtt: false,
        })
    }

    #[test]
    fn severity_ladder_maps_to_cookie_policies() {
        assert_eq!(
            policy(Severity::Mild, Severity::Mild).third_party_cookies,
            ThirdPartyCookiePolicy::Allowed
        );
        assert_eq!(
            policy(Severity::Strict, Severity::Strict).third_party_cookies,
            ThirdPartyCookiePolicy::Partitioned
        );
        assert_eq!(
            policy(Severity::Aggressive, Severity::Aggressive).third_party_cookies,
            ThirdPartyCookiePolicy::Blocked
        );
    }

    #[test]
    fn known_tracker_is_blocked_and_counted() {
        let mut shield_policy = policy(Severity::Standard, Severity::Standard);
        shield_policy.exempt("friendly.test");
        let shield = PrivacyShield::new(shield_policy);
        shield.registry().add_tracker(TrackerDefinition::simple(
            "Test Pixel",
            "Test Org",
            TrackerCategory::Advertising,
            &["tracker.test"],
            BlockStrategy::ResourceAndCookie,
        ));

        let source = Url::parse("https://news.test/").unwrap();
        let tracker = Url::parse("https://tracker.test/px.gif").unwrap();
        assert!(shield.should_block(&tracker, &source));

        let request = HttpRequest::get(tracker.clone());
        let modified = shield.modify_request(request, &source);
        assert_eq!(modified.url.as_str(), "about:blank");
        assert_eq!(shield.blocked_count("tracker.test", "news.test"), 1);

        // Exempt page origins bypass blocking entirely.
        let exempt_source = Url::parse("https://friendly.test/").unwrap();
        assert!(!shield.should_block(&tracker, &exempt_source));
    }

    #[test]
    fn subdomains_of_tracker_domains_match() {
        let shield = PrivacyShield::new(policy(Severity::Standard, Severity::Standard));
        shield.registry().add_tracker(TrackerDefinition::simple(
            "Wide Net",
            "Org",
            TrackerCategory::Analytics,
            &["metrics.test"],
            BlockStrategy::Resource,
        ));
        let source = Url::parse("https://site.test/").unwrap();
        let sub = Url::parse("https://deep.cdn.metrics.test/beacon").unwrap();
        assert!(shield.should_block(&sub, &source));
    }

    #[test]
    fn strict_severity_drops_tcp_ice_candidates() {
        let strict = policy(Severity::Strict, Severity::Standard);
        assert!(strict.disable_ice_tcp);
        let shield = PrivacyShield::new(strict);

        let candidates = vec![
            "candidate:1 1 udp 2122260223 192.168.1.7 56789 typ host".to_string(),
            "candidate:5 1 tcp 1518280447 192.168.1.7 9 typ host tcptype active".to_string(),
        ];
        let output = shield.sanitize_ice_candidates(&candidates);
        assert_eq!(output.len(), 1);
        let survivor = IceCandidate::parse(&output[0]).unwrap();
        assert_eq!(survivor.transport, "udp");

        // Mild severity leaves TCP candidates alone.
        let mild = policy(Severity::Mild, Severity::Standard);
        assert!(!mild.disable_ice_tcp);
        let shield = PrivacyShield::new(mild);
        assert_eq!(shield.sanitize_ice_candidates(&candidates).len(), 2);
    }

    #[test]
    fn blocking_is_stable_under_url_normalization() {
        let shield = PrivacyShield::new(policy(Severity::Standard, Severity::Standard));
        shield.registry().add_tracker(TrackerDefinition::simple(
            "Pixel",
            "Org",
            TrackerCategory::Advertising,
            &["pixel.test"],
            BlockStrategy::Resource,
        ));
        let source = Url::parse("https://site.test/").unwrap();
        for variant in [
            "https://pixel.test/p",
            "HTTPS://PIXEL.TEST/p",
            "https://pixel.test:443/p",
        ] {
            let url = Url::parse(variant).unwrap();
            assert!(shield.should_block(&url, &source), "variant {variant}");
        }
    }
}

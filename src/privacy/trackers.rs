//! Tracker definitions, matching, and custom rules.
//!
//! A request matches a tracker when its host equals or is a subdomain of
//! one of the tracker's domains, or its URL matches one of the tracker's
//! patterns, or a user-added custom rule matches. Custom rules carry a
//! priority; the highest-priority match decides the strategy.

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

/// Why a tracker exists, per the catalog taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackerCategory {
    Advertising,
    Analytics,
    Social,
    Content,
    Cryptomining,
    Fingerprinting,
    /// Required for sites to function; never resource-blocked by default.
    Essential,
    Misc,
}

/// What to do with a matched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockStrategy {
    /// Explicitly allowed.
    None,
    /// Neutralize the resource request.
    Resource,
    /// Let the request through, refuse its cookies.
    Cookie,
    /// Both of the above.
    ResourceAndCookie,
    /// Let it through after stripping tracking parameters.
    ModifyRequest,
}

/// A user-added rule applied on top of the catalog.
#[derive(Debug, Clone)]
pub struct CustomRule {
    pub pattern: Regex,
    pub strategy: BlockStrategy,
    /// Higher wins when several rules match.
    pub priority: i32,
}

/// One tracker in the catalog.
#[derive(Debug, Clone)]
pub struct TrackerDefinition {
    pub name: String,
    pub organization: String,
    pub category: TrackerCategory,
    /// Exact domains; subdomains match implicitly.
    pub domains: Vec<String>,
    pub url_patterns: Vec<Regex>,
    pub default_strategy: BlockStrategy,
    /// Per-tracker rules, priority ordered.
    pub rules: Vec<CustomRule>,
}

impl TrackerDefinition {
    /// A domain-only definition with no URL patterns or rules.
    pub fn simple(
        name: &str,
        organization: &str,
        category: TrackerCategory,
        domains: &[&str],
        strategy: BlockStrategy,
    ) -> Self {
        Self {
            name: name.to_string(),
            organization: organization.to_string(),
            category,
            domains: domains.iter().map(|d| d.to_string()).collect(),
            url_patterns: Vec::new(),
            default_strategy: strategy,
            rules: Vec::new(),
        }
    }

    fn matches_host(&self, host: &str) -> bool {
        self.domains
            .iter()
            .any(|domain| host == domain || host.ends_with(&format!(".{domain}")))
    }

    fn matches_url(&self, url: &str) -> bool {
        self.url_patterns.iter().any(|p| p.is_match(url))
    }
}

/// The tracker catalog plus user rules.
pub struct TrackerRegistry {
    trackers: RwLock<Vec<TrackerDefinition>>,
    custom_rules: RwLock<Vec<CustomRule>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self {
            trackers: RwLock::new(Vec::new()),
            custom_rules: RwLock::new(Vec::new()),
        }
    }

    /// Registry seeded with the built-in catalog of widespread trackers.
    pub fn with_builtin_catalog() -> Self {
        let registry = Self::new();
        for tracker in builtin_catalog() {
            registry.add_tracker(tracker);
        }
        registry
    }

    pub fn add_tracker(&self, tracker: TrackerDefinition) {
        self.trackers.write().push(tracker);
    }

    /// Add a user rule; rules are kept sorted by descending priority.
    pub fn add_custom_rule(&self, rule: CustomRule) {
        let mut rules = self.custom_rules.write();
        rules.push(rule);
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
    }

    /// Whether the catalog lists `domain` as a tracker-owned domain.
    pub fn is_tracker_domain(&self, domain: &str) -> bool {
        self.trackers
            .read()
            .iter()
            .any(|t| t.matches_host(domain))
    }

    /// The strategy for `url`, if anything matches.
    ///
    /// Custom rules win over the catalog; among custom rules the highest
    /// priority wins. Catalog matches fall through host checks first,
    /// then URL patterns.
    pub fn match_strategy(&self, url: &Url) -> Option<BlockStrategy> {
        let url_str = url.as_str();
        {
            let rules = self.custom_rules.read();
            if let Some(rule) = rules.iter().find(|r| r.pattern.is_match(url_str)) {
                return Some(rule.strategy);
            }
        }

        let host = url.host_str()?;
        let trackers = self.trackers.read();
        for tracker in trackers.iter() {
            if tracker.matches_host(host) || tracker.matches_url(url_str) {
                // Per-tracker rules refine the default.
                if let Some(rule) = tracker.rules.iter().find(|r| r.pattern.is_match(url_str)) {
                    return Some(rule.strategy);
                }
                return Some(tracker.default_strategy);
            }
        }
        None
    }
}

impl Default for TrackerRegistry {
    fn default() -> Self {
        Self::with_builtin_catalog()
    }
}

/// Query parameters that exist to track clicks across sites.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "dclid",
    "msclkid",
    "mc_eid",
    "igshid",
    "twclid",
    "yclid",
    "_hsenc",
    "_hsmi",
    "vero_id",
    "wickedid",
];

/// Remove tracking parameters from a URL, leaving the rest intact.
pub fn strip_tracking_params(url: &Url) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !TRACKING_PARAMS.contains(&name.as_ref()))
        .map(|(n, v)| (n.into_owned(), v.into_owned()))
        .collect();
    let mut cleaned = url.clone();
    if kept.is_empty() {
        cleaned.set_query(None);
    } else {
        let query: Vec<String> = kept.iter().map(|(n, v)| format!("{n}={v}")).collect();
        cleaned.set_query(Some(&query.join("&")));
    }
    cleaned
}

/// Names of parameters the ML feature extractor treats as tracking
/// signals.
pub fn is_tracking_param(name: &str) -> bool {
    TRACKING_PARAMS.contains(&name) || name.starts_with("utm_")
}

fn builtin_catalog() -> Vec<TrackerDefinition> {
    let re = |s: &str| Regex::new(s).expect("catalog pattern compiles");
    vec![
        TrackerDefinition::simple(
            "Google Ads",
            "Google LLC",
            TrackerCategory::Advertising,
            &["doubleclick.net", "googlesyndication.com", "googleadservices.com"],
            BlockStrategy::ResourceAndCookie,
        ),
        TrackerDefinition::simple(
            "Google Analytics",
            "Google LLC",
            TrackerCategory::Analytics,
            &["google-analytics.com", "googletagmanager.com"],
            BlockStrategy::ResourceAndCookie,
        ),
        TrackerDefinition {
            name: "Meta Pixel".to_string(),
            organization: "Meta Platforms".to_string(),
            category: TrackerCategory::Social,
            domains: vec!["connect.facebook.net".to_string()],
            url_patterns: vec![re(r"https?://www\.facebook\.com/tr[/?]")],
            default_strategy: BlockStrategy::ResourceAndCookie,
            rules: Vec::new(),
        },
        TrackerDefinition::simple(
            "Hotjar",
            "Hotjar Ltd",
            TrackerCategory::Analytics,
            &["hotjar.com", "hotjar.io"],
            BlockStrategy::Resource,
        ),
        TrackerDefinition::simple(
            "Criteo",
            "Criteo SA",
            TrackerCategory::Advertising,
            &["criteo.com", "criteo.net"],
            BlockStrategy::ResourceAndCookie,
        ),
        TrackerDefinition::simple(
            "Coinhive",
            "Coinhive",
            TrackerCategory::Cryptomining,
            &["coinhive.com", "coin-hive.com"],
            BlockStrategy::Resource,
        ),
        TrackerDefinition::simple(
            "FingerprintJS",
            "FingerprintJS Inc",
            TrackerCategory::Fingerprinting,
            &["fpjs.io", "fingerprintjs.com"],
            BlockStrategy::Resource,
        ),
        TrackerDefinition::simple(
            "Scorecard Research",
            "comScore",
            TrackerCategory::Analytics,
            &["scorecardresearch.com"],
            BlockStrategy::ResourceAndCookie,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_matches_known_domains() {
        let registry = TrackerRegistry::with_builtin_catalog();
        let url = Url::parse("https://stats.g.doubleclick.net/collect").unwrap();
        assert_eq!(
            registry.match_strategy(&url),
            Some(BlockStrategy::ResourceAndCookie)
        );
        assert!(registry.is_tracker_domain("google-analytics.com"));
        assert!(!registry.is_tracker_domain("example.test"));
    }

    #[test]
    fn url_patterns_match_without_domain_listing() {
        let registry = TrackerRegistry::with_builtin_catalog();
        let url = Url::parse("https://www.facebook.com/tr?id=123&ev=PageView").unwrap();
        assert_eq!(
            registry.match_strategy(&url),
            Some(BlockStrategy::ResourceAndCookie)
        );
        // The bare site is not in the catalog, only the pixel endpoint.
        let site = Url::parse("https://www.facebook.com/somepage").unwrap();
        assert_eq!(registry.match_strategy(&site), None);
    }

    #[test]
    fn highest_priority_custom_rule_wins() {
        let registry = TrackerRegistry::new();
        registry.add_custom_rule(CustomRule {
            pattern: Regex::new(r"https://ads\.site\.test/").unwrap(),
            strategy: BlockStrategy::Resource,
            priority: 1,
        });
        registry.add_custom_rule(CustomRule {
            pattern: Regex::new(r"https://ads\.site\.test/allowed/").unwrap(),
            strategy: BlockStrategy::None,
            priority: 10,
        });

        let blocked = Url::parse("https://ads.site.test/banner.js").unwrap();
        assert_eq!(registry.match_strategy(&blocked), Some(BlockStrategy::Resource));
        let allowed = Url::parse("https://ads.site.test/allowed/pixel").unwrap();
        assert_eq!(registry.match_strategy(&allowed), Some(BlockStrategy::None));
    }

    #[test]
    fn stripping_removes_only_tracking_params() {
        let url = Url::parse(
            "https://shop.test/item?id=42&utm_source=mail&fbclid=abc&color=red",
        )
        .unwrap();
        let cleaned = strip_tracking_params(&url);
        assert_eq!(cleaned.as_str(), "https://shop.test/item?id=42&color=red");

        let no_query = Url::parse("https://shop.test/item?utm_source=mail").unwrap();
        assert_eq!(
            strip_tracking_params(&no_query).as_str(),
            "https://shop.test/item"
        );
    }
}

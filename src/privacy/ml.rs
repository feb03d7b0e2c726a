//! Optional ML-assisted tracker detection.
//!
//! A pluggable classifier maps a request feature vector to a tracking
//! probability. The path is strictly additive to the rule set: a
//! confident classifier verdict can flag a request no rule matched, but
//! can never weaken or override a rule decision.

use std::collections::HashMap;

use url::Url;

use crate::privacy::trackers::is_tracking_param;

/// Probability above which a classifier verdict is acted on.
pub const CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Features extracted from one request.
#[derive(Debug, Clone)]
pub struct FeatureVector {
    /// Shannon entropy of the URL string, bits per byte.
    pub url_entropy: f64,
    pub url_length: usize,
    pub param_count: usize,
    /// Query parameters with known tracking names.
    pub tracking_param_count: usize,
    pub third_party: bool,
    /// Path suggests a pixel/beacon payload.
    pub beacon_shaped: bool,
}

impl FeatureVector {
    pub fn from_request(url: &Url, source_origin: &Url) -> Self {
        let url_str = url.as_str();
        let params: Vec<(String, String)> = url
            .query_pairs()
            .map(|(n, v)| (n.into_owned(), v.into_owned()))
            .collect();
        let tracking_param_count = params
            .iter()
            .filter(|(name, _)| is_tracking_param(name))
            .count();
        let path = url.path().to_ascii_lowercase();
        let beacon_shaped = path.ends_with(".gif")
            || path.ends_with("/pixel")
            || path.contains("beacon")
            || path.contains("/tr/")
            || path.ends_with("/collect");
        let third_party = match (url.host_str(), source_origin.host_str()) {
            (Some(a), Some(b)) => {
                crate::privacy::cookies::site_of(a) != crate::privacy::cookies::site_of(b)
            }
            _ => true,
        };
        Self {
            url_entropy: entropy(url_str),
            url_length: url_str.len(),
            param_count: params.len(),
            tracking_param_count,
            third_party,
            beacon_shaped,
        }
    }
}

fn entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<u8, usize> = HashMap::new();
    for byte in s.bytes() {
        *counts.entry(byte).or_insert(0) += 1;
    }
    let len = s.len() as f64;
    counts
        .values()
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// The classifier seam.
pub trait TrackerClassifier: Send + Sync {
    /// Probability in [0, 1] that the request is a tracker.
    fn probability(&self, features: &FeatureVector) -> f64;
}

/// Logistic model over the feature vector.
///
/// The default weights are conservative: they only push past the
/// confidence threshold when several independent signals agree.
pub struct LogisticClassifier {
    pub bias: f64,
    pub w_entropy: f64,
    pub w_length: f64,
    pub w_params: f64,
    pub w_tracking_params: f64,
    pub w_third_party: f64,
    pub w_beacon: f64,
}

impl Default for LogisticClassifier {
    fn default() -> Self {
        Self {
            bias: -3.0,
            w_entropy: 0.35,
            w_length: 0.004,
            w_params: 0.15,
            w_tracking_params: 1.2,
            w_third_party: 1.4,
            w_beacon: 1.8,
        }
    }
}

impl TrackerClassifier for LogisticClassifier {
    fn probability(&self, features: &FeatureVector) -> f64 {
        let z = self.bias
            + self.w_entropy * features.url_entropy
            + self.w_length * features.url_length as f64
            + self.w_params * features.param_count as f64
            + self.w_tracking_params * features.tracking_param_count as f64
            + self.w_third_party * if features.third_party { 1.0 } else { 0.0 }
            + self.w_beacon * if features.beacon_shaped { 1.0 } else { 0.0 };
        1.0 / (1.0 + (-z).exp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(url: &str, origin: &str) -> FeatureVector {
        FeatureVector::from_request(&Url::parse(url).unwrap(), &Url::parse(origin).unwrap())
    }

    #[test]
    fn beacon_urls_score_above_the_threshold() {
        let classifier = LogisticClassifier::default();
        let f = features(
            "https://metrics.example/collect?utm_source=mail&utm_campaign=x&uid=a9f3k2m4",
            "https://news.test/",
        );
        assert!(f.third_party);
        assert!(f.beacon_shaped);
        assert!(classifier.probability(&f) > CONFIDENCE_THRESHOLD);
    }

    #[test]
    fn plain_same_site_content_scores_low() {
        let classifier = LogisticClassifier::default();
        let f = features("https://news.test/article/today", "https://news.test/");
        assert!(!f.third_party);
        assert!(classifier.probability(&f) < CONFIDENCE_THRESHOLD);
    }

    #[test]
    fn tracking_params_raise_the_score() {
        let classifier = LogisticClassifier::default();
        let without = features("https://cdn.test/lib.js", "https://news.test/");
        let with = features(
            "https://cdn.test/lib.js?fbclid=abc&gclid=def&utm_source=x",
            "https://news.test/",
        );
        assert!(classifier.probability(&with) > classifier.probability(&without));
    }
}

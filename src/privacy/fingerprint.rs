//! Fingerprint-surface attenuation.
//!
//! Each fingerprint vector (canvas pixels, WebGL parameters, audio
//! context output, font enumeration, user-agent, screen metrics,
//! languages, client hints) gets a per-domain attenuation setting. With
//! consistent values enabled, a per-session salt seeds deterministic
//! choices so one site always sees the same spoofed values within a
//! session, while two sites see different ones.

use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanvasProtection {
    Off,
    /// Per-session noise added to pixel reads.
    Noise,
    /// Slight deterministic color shift.
    ColorShift,
    /// Reads return a blank surface.
    Block,
    /// Reads return a plausible fake surface.
    Fake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebGlProtection {
    Off,
    SpoofVendor,
    LimitParameters,
    Noise,
    Disable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FontStrategy {
    Real,
    /// Only a cross-platform common set is enumerable.
    CommonOnly,
    /// A stable per-site subset of the real list.
    Subset,
    Randomize,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserAgentMode {
    Real,
    /// The most common generic UA for the platform.
    Generic,
    /// Random but stable per (session, site).
    RandomConsistent,
    /// A fresh value per request.
    Rotating,
}

/// Effective attenuation for one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintConfig {
    pub canvas: CanvasProtection,
    pub webgl: WebGlProtection,
    /// Noise amplitude mixed into audio-context output, 0.0 disables.
    pub audio_noise_level: f64,
    pub fonts: FontStrategy,
    pub user_agent: UserAgentMode,
    /// Reported screen resolution, chosen from a common set.
    pub screen_resolution: (u32, u32),
    /// Reported primary language.
    pub language: String,
    /// Strip high-entropy client hints.
    pub reduce_client_hints: bool,
    /// Whether choices are session-stable per site.
    pub consistent_values: bool,
}

/// Resolutions common enough to hide in.
const COMMON_RESOLUTIONS: &[(u32, u32)] = &[
    (1920, 1080),
    (1366, 768),
    (1536, 864),
    (1440, 900),
    (2560, 1440),
];

/// Languages common enough to hide in.
const COMMON_LANGUAGES: &[&str] = &["en-US", "en-GB", "de-DE", "fr-FR", "es-ES"];

/// Per-domain fingerprint configuration source.
pub struct FingerprintDefense {
    severity: Severity,
    session_salt: [u8; 32],
    overrides: DashMap<String, FingerprintConfig>,
}

impl FingerprintDefense {
    pub fn new(severity: Severity) -> Self {
        let mut session_salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut session_salt);
        Self {
            severity,
            session_salt,
            overrides: DashMap::new(),
        }
    }

    /// Pin an explicit configuration for one domain.
    pub fn set_override(&self, domain: impl Into<String>, config: FingerprintConfig) {
        self.overrides.insert(domain.into(), config);
    }

    /// The attenuation configuration for `domain`.
    ///
    /// Severity selects vector coverage; the session salt plus the
    /// domain select the concrete spoofed values, deterministically, so
    /// repeat evaluations within the session agree.
    pub fn evaluate(&self, domain: &str) -> FingerprintConfig {
        if let Some(config) = self.overrides.get(domain) {
            return config.clone();
        }

        let seed = self.domain_seed(domain);
        let resolution = COMMON_RESOLUTIONS[(seed % COMMON_RESOLUTIONS.len() as u64) as usize];
        let language =
            COMMON_LANGUAGES[((seed >> 8) % COMMON_LANGUAGES.len() as u64) as usize].to_string();

        match self.severity {
            Severity::Mild => FingerprintConfig {
                canvas: CanvasProtection::Off,
                webgl: WebGlProtection::Off,
                audio_noise_level: 0.0,
                fonts: FontStrategy::Real,
                user_agent: UserAgentMode::Real,
                screen_resolution: resolution,
                language: "en-US".to_string(),
                reduce_client_hints: false,
                consistent_values: true,
            },
            Severity::Standard => FingerprintConfig {
                canvas: CanvasProtection::Noise,
                webgl: WebGlProtection::SpoofVendor,
                audio_noise_level: 0.0001,
                fonts: FontStrategy::CommonOnly,
                user_agent: UserAgentMode::Generic,
                screen_resolution: resolution,
                language,
                reduce_client_hints: true,
                consistent_values: true,
            },
            Severity::Strict => FingerprintConfig {
                canvas: CanvasProtection::ColorShift,
                webgl: WebGlProtection::LimitParameters,
                audio_noise_level: 0.001,
                fonts: FontStrategy::Subset,
                user_agent: UserAgentMode::RandomConsistent,
                screen_resolution: resolution,
                language,
                reduce_client_hints: true,
                consistent_values: true,
            },
            Severity::Aggressive => FingerprintConfig {
                canvas: CanvasProtection::Block,
                webgl: WebGlProtection::Disable,
                audio_noise_level: 0.01,
                fonts: FontStrategy::Block,
                user_agent: UserAgentMode::Rotating,
                screen_resolution: resolution,
                language,
                reduce_client_hints: true,
                // Rotating values are deliberately inconsistent.
                consistent_values: false,
            },
        }
    }

    /// Deterministic per-(session, domain) seed.
    fn domain_seed(&self, domain: &str) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.session_salt);
        hasher.update(domain.as_bytes());
        let digest = hasher.finalize();
        u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_is_stable_within_a_session() {
        let defense = FingerprintDefense::new(Severity::Strict);
        let first = defense.evaluate("news.test");
        let second = defense.evaluate("news.test");
        assert_eq!(first, second);
    }

    #[test]
    fn different_domains_can_draw_different_values() {
        let defense = FingerprintDefense::new(Severity::Strict);
        // Across enough domains, at least two distinct resolutions or
        // languages must appear; a constant output would mean the seed
        // is ignored.
        let configs: Vec<FingerprintConfig> = (0..16)
            .map(|i| defense.evaluate(&format!("site{i}.test")))
            .collect();
        let distinct_res: std::collections::HashSet<(u32, u32)> =
            configs.iter().map(|c| c.screen_resolution).collect();
        let distinct_lang: std::collections::HashSet<&str> =
            configs.iter().map(|c| c.language.as_str()).collect();
        assert!(distinct_res.len() > 1 || distinct_lang.len() > 1);
    }

    #[test]
    fn severity_widens_vector_coverage() {
        let mild = FingerprintDefense::new(Severity::Mild).evaluate("a.test");
        assert_eq!(mild.canvas, CanvasProtection::Off);
        assert_eq!(mild.fonts, FontStrategy::Real);

        let standard = FingerprintDefense::new(Severity::Standard).evaluate("a.test");
        assert_eq!(standard.canvas, CanvasProtection::Noise);
        assert!(standard.reduce_client_hints);

        let aggressive = FingerprintDefense::new(Severity::Aggressive).evaluate("a.test");
        assert_eq!(aggressive.canvas, CanvasProtection::Block);
        assert_eq!(aggressive.webgl, WebGlProtection::Disable);
        assert_eq!(aggressive.user_agent, UserAgentMode::Rotating);
        assert!(!aggressive.consistent_values);
    }

    #[test]
    fn overrides_win_over_derived_config() {
        let defense = FingerprintDefense::new(Severity::Mild);
        let custom = FingerprintConfig {
            canvas: CanvasProtection::Fake,
            webgl: WebGlProtection::Noise,
            audio_noise_level: 0.5,
            fonts: FontStrategy::Randomize,
            user_agent: UserAgentMode::Rotating,
            screen_resolution: (800, 600),
            language: "eo".to_string(),
            reduce_client_hints: true,
            consistent_values: false,
        };
        defense.set_override("weird.test", custom.clone());
        assert_eq!(defense.evaluate("weird.test"), custom);
    }
}

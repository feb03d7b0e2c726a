//! # Command-Line Interface Module
//!
//! Argument parsing and configuration assembly for the host binary. Uses
//! the `clap` derive API; every flag maps onto the startup configuration
//! surface, and the assembled [`CoreConfig`] is validated once before
//! any subsystem starts.
//!
//! ## Usage Examples
//!
//! ```bash
//! # Defaults: medium security, standard privacy, hybrid cache eviction
//! nimbus
//!
//! # Strict privacy with a pinned cellular profile
//! nimbus --tracker-severity strict --cookie-severity strict \
//!        --network-profile cellular-lte
//!
//! # Custom security feature set
//! nimbus --security-level custom \
//!        --security-features strict-tls,hsts,secure-dns
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Styles};
use clap::Parser;

use crate::config::{
    CompressionCacheConfig, CoreConfig, DnsConfig, EvictionPolicy, IpcConfig, PrivacyConfig,
    SecurityFeature, SecurityLevel, Severity,
};
use crate::error::{CoreError, CoreResult};

/// Defines the styles for the help message.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Nimbus engine core host.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Overall security posture: low, medium, high, very-high, custom
    #[arg(long, default_value = "medium", help_heading = "Security")]
    pub security_level: String,

    /// Comma-separated feature list used with --security-level custom
    /// (strict-tls, block-mixed-content, hsts, dnssec, sri, expect-ct,
    /// certificate-verification, secure-dns)
    #[arg(long, value_delimiter = ',', help_heading = "Security")]
    pub security_features: Vec<String>,

    /// Named network profile to pin (wired, wifi-fast, wifi-typical,
    /// cellular-lte, cellular-3g, satellite); omit to let the optimizer
    /// choose from observation
    #[arg(long, help_heading = "Network")]
    pub network_profile: Option<String>,

    /// Disable 0-RTT session resumption for replay hardening
    #[arg(long, help_heading = "Network")]
    pub disable_zero_rtt: bool,

    /// Tracker blocking severity: mild, standard, strict, aggressive
    #[arg(long, default_value = "standard", help_heading = "Privacy")]
    pub tracker_severity: String,

    /// Cookie policy severity: mild, standard, strict, aggressive
    #[arg(long, default_value = "standard", help_heading = "Privacy")]
    pub cookie_severity: String,

    /// Fingerprint resistance severity: mild, standard, strict, aggressive
    #[arg(long, default_value = "standard", help_heading = "Privacy")]
    pub fingerprint_severity: String,

    /// Compression cache capacity in bytes
    #[arg(long, default_value_t = crate::defaults::COMPRESSION_CACHE_BYTES, help_heading = "Cache")]
    pub cache_max_bytes: u64,

    /// Compression cache eviction policy: lru, lfu, ttl, hybrid
    #[arg(long, default_value = "hybrid", help_heading = "Cache")]
    pub cache_policy: String,

    /// Compression cache entry TTL in seconds
    #[arg(long, default_value_t = 3600, help_heading = "Cache")]
    pub cache_ttl_seconds: u64,

    /// DoH endpoints tried in rotation
    #[arg(long, value_delimiter = ',', help_heading = "DNS")]
    pub doh_endpoints: Vec<String>,

    /// DNS cache capacity in entries
    #[arg(long, default_value_t = crate::defaults::DNS_CACHE_ENTRIES, help_heading = "DNS")]
    pub dns_cache_max_entries: usize,

    /// TTL in seconds applied to upstream answers that carry none
    #[arg(long, default_value_t = 300, help_heading = "DNS")]
    pub dns_default_ttl_seconds: u64,

    /// IPC transport buffer size in bytes
    #[arg(long, default_value_t = 65536, help_heading = "IPC")]
    pub ipc_buffer_size: usize,

    /// Outbound queue bound per channel
    #[arg(long, default_value_t = 1024, help_heading = "IPC")]
    pub ipc_queue_size: usize,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value_t = 5000, help_heading = "IPC")]
    pub ipc_heartbeat_ms: u64,

    /// Default request/response deadline in milliseconds
    #[arg(long, default_value_t = 30000, help_heading = "IPC")]
    pub ipc_default_timeout_ms: u64,

    /// Directory for persisted subsystem state; omit to run ephemeral
    #[arg(long, help_heading = "Storage")]
    pub state_dir: Option<PathBuf>,
}

fn parse_severity(value: &str) -> CoreResult<Severity> {
    match value {
        "mild" => Ok(Severity::Mild),
        "standard" => Ok(Severity::Standard),
        "strict" => Ok(Severity::Strict),
        "aggressive" => Ok(Severity::Aggressive),
        other => Err(CoreError::Config(format!("unknown severity {other:?}"))),
    }
}

fn parse_security_level(value: &str) -> CoreResult<SecurityLevel> {
    match value {
        "low" => Ok(SecurityLevel::Low),
        "medium" => Ok(SecurityLevel::Medium),
        "high" => Ok(SecurityLevel::High),
        "very-high" => Ok(SecurityLevel::VeryHigh),
        "custom" => Ok(SecurityLevel::Custom),
        other => Err(CoreError::Config(format!(
            "unknown security level {other:?}"
        ))),
    }
}

fn parse_security_feature(value: &str) -> CoreResult<SecurityFeature> {
    use SecurityFeature::*;
    Ok(match value {
        "strict-tls" => StrictTls,
        "block-mixed-content" => BlockMixedContent,
        "hsts" => Hsts,
        "dnssec" => Dnssec,
        "sri" => Sri,
        "expect-ct" => ExpectCt,
        "certificate-verification" => CertificateVerification,
        "secure-dns" => SecureDns,
        other => {
            return Err(CoreError::Config(format!(
                "unknown security feature {other:?}"
            )))
        }
    })
}

fn parse_eviction_policy(value: &str) -> CoreResult<EvictionPolicy> {
    match value {
        "lru" => Ok(EvictionPolicy::Lru),
        "lfu" => Ok(EvictionPolicy::Lfu),
        "ttl" => Ok(EvictionPolicy::Ttl),
        "hybrid" => Ok(EvictionPolicy::Hybrid),
        other => Err(CoreError::Config(format!(
            "unknown eviction policy {other:?}"
        ))),
    }
}

impl Args {
    /// Assemble and validate the core configuration.
    pub fn to_config(&self) -> CoreResult<CoreConfig> {
        let security_features: HashSet<SecurityFeature> = self
            .security_features
            .iter()
            .map(|f| parse_security_feature(f))
            .collect::<CoreResult<_>>()?;

        let mut dns = DnsConfig {
            cache_max_entries: self.dns_cache_max_entries,
            default_ttl: Duration::from_secs(self.dns_default_ttl_seconds),
            ..Default::default()
        };
        if !self.doh_endpoints.is_empty() {
            dns.doh_endpoints = self.doh_endpoints.clone();
        }

        let config = CoreConfig {
            security_level: parse_security_level(&self.security_level)?,
            security_features,
            network_profile: self.network_profile.clone(),
            privacy: PrivacyConfig {
                tracker_severity: parse_severity(&self.tracker_severity)?,
                cookie_severity: parse_severity(&self.cookie_severity)?,
                fingerprint_severity: parse_severity(&self.fingerprint_severity)?,
                disable_zero_rtt: self.disable_zero_rtt,
            },
            compression: CompressionCacheConfig {
                max_bytes: self.cache_max_bytes,
                max_single_entry_bytes: (self.cache_max_bytes / 8).max(1),
                policy: parse_eviction_policy(&self.cache_policy)?,
                ttl: Duration::from_secs(self.cache_ttl_seconds),
            },
            dns,
            ipc: IpcConfig {
                buffer_size: self.ipc_buffer_size,
                queue_size: self.ipc_queue_size,
                heartbeat_interval: Duration::from_millis(self.ipc_heartbeat_ms),
                default_timeout: Duration::from_millis(self.ipc_default_timeout_ms),
                compress_threshold: 8 * 1024,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_args_build_a_valid_config() {
        let args = Args::parse_from(["nimbus"]);
        let config = args.to_config().unwrap();
        assert_eq!(config.security_level, SecurityLevel::Medium);
        assert_eq!(config.privacy.tracker_severity, Severity::Standard);
    }

    #[test]
    fn severities_and_profiles_parse() {
        let args = Args::parse_from([
            "nimbus",
            "--tracker-severity",
            "strict",
            "--cookie-severity",
            "aggressive",
            "--network-profile",
            "cellular-lte",
            "--cache-policy",
            "lfu",
        ]);
        let config = args.to_config().unwrap();
        assert_eq!(config.privacy.tracker_severity, Severity::Strict);
        assert_eq!(config.privacy.cookie_severity, Severity::Aggressive);
        assert_eq!(config.network_profile.as_deref(), Some("cellular-lte"));
        assert_eq!(config.compression.policy, EvictionPolicy::Lfu);
    }

    #[test]
    fn custom_level_requires_features() {
        let args = Args::parse_from(["nimbus", "--security-level", "custom"]);
        assert!(args.to_config().is_err());

        let args = Args::parse_from([
            "nimbus",
            "--security-level",
            "custom",
            "--security-features",
            "strict-tls,hsts",
        ]);
        let config = args.to_config().unwrap();
        assert_eq!(config.effective_security_features().len(), 2);
    }

    #[test]
    fn unknown_values_are_config_errors() {
        let args = Args::parse_from(["nimbus", "--tracker-severity", "paranoid"]);
        assert!(matches!(args.to_config(), Err(CoreError::Config(_))));
    }
}

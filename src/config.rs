//! # Core Configuration Surface
//!
//! All process-wide tunables accepted at startup, validated once before any
//! subsystem initializes. Invalid combinations surface a single
//! configuration error (host exit code 1) rather than failing piecemeal
//! later.
//!
//! ## Configuration Categories
//!
//! - **Security**: TLS strictness, mixed content, HSTS, DNSSEC, SRI
//! - **Network**: named profile selection or an explicit profile bundle
//! - **Privacy**: tracker / cookie / fingerprint severity levels
//! - **Compression cache**: capacity, eviction policy, TTL
//! - **DNS**: DoH endpoints, cache sizing, default TTL
//! - **IPC**: buffer and queue sizes, heartbeat interval, default timeout
//!
//! The optimizer's active profile and the shield's policy are process-wide
//! state; they are held here as explicit objects and passed into subsystem
//! constructors, never read through globals.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Overall security posture selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
    VeryHigh,
    /// Feature set supplied explicitly via `security.features`.
    Custom,
}

/// Individually toggleable security features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityFeature {
    StrictTls,
    BlockMixedContent,
    Hsts,
    Dnssec,
    Sri,
    ExpectCt,
    CertificateVerification,
    SecureDns,
}

impl SecurityLevel {
    /// Expand a named level into its feature set.
    ///
    /// `Custom` expands to nothing; the explicit feature list governs.
    pub fn features(self) -> HashSet<SecurityFeature> {
        use SecurityFeature::*;
        let list: &[SecurityFeature] = match self {
            SecurityLevel::Low => &[CertificateVerification],
            SecurityLevel::Medium => &[CertificateVerification, BlockMixedContent, Hsts],
            SecurityLevel::High => &[
                CertificateVerification,
                BlockMixedContent,
                Hsts,
                StrictTls,
                Sri,
                SecureDns,
            ],
            SecurityLevel::VeryHigh => &[
                CertificateVerification,
                BlockMixedContent,
                Hsts,
                StrictTls,
                Sri,
                SecureDns,
                Dnssec,
                ExpectCt,
            ],
            SecurityLevel::Custom => &[],
        };
        list.iter().copied().collect()
    }
}

/// Privacy severity shared by the tracker, cookie, and fingerprint policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Mild,
    Standard,
    Strict,
    Aggressive,
}

/// Compression cache eviction policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Ttl,
    Hybrid,
}

/// Compression cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionCacheConfig {
    /// Upper bound on the sum of all cached compressed bytes.
    pub max_bytes: u64,
    /// Largest single entry admitted to the cache.
    pub max_single_entry_bytes: u64,
    pub policy: EvictionPolicy,
    /// Entry lifetime for the TTL and hybrid policies.
    pub ttl: Duration,
}

impl Default for CompressionCacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            max_single_entry_bytes: 32 * 1024 * 1024,
            policy: EvictionPolicy::Hybrid,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// DNS resolver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// DoH endpoint URLs tried in rotation when secure DNS is selected.
    pub doh_endpoints: Vec<String>,
    /// DoT host:port endpoints.
    pub dot_endpoints: Vec<String>,
    pub cache_max_entries: usize,
    /// TTL applied when the upstream answer carries none.
    pub default_ttl: Duration,
    /// TTL for cached NXDOMAIN / SERVFAIL answers.
    pub negative_ttl: Duration,
    /// Elapsed-TTL fraction that triggers a background refresh.
    pub prefetch_threshold: f64,
    pub query_timeout: Duration,
    /// Upstream attempts before the resolve fails.
    pub max_retries: u32,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            doh_endpoints: vec![
                "https://cloudflare-dns.com/dns-query".to_string(),
                "https://dns.google/dns-query".to_string(),
            ],
            dot_endpoints: vec!["1.1.1.1:853".to_string()],
            cache_max_entries: 4096,
            default_ttl: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(30),
            prefetch_threshold: 0.8,
            query_timeout: Duration::from_secs(3),
            max_retries: 2,
        }
    }
}

/// IPC fabric settings applied to every channel unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Transport read/write buffer size in bytes.
    pub buffer_size: usize,
    /// Outbound queue capacity per channel; sends fail once full.
    pub queue_size: usize,
    pub heartbeat_interval: Duration,
    /// Deadline applied to `send_and_await` when the caller gives none.
    pub default_timeout: Duration,
    /// Payloads larger than this are transparently compressed on the wire.
    pub compress_threshold: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            queue_size: 1024,
            heartbeat_interval: Duration::from_secs(5),
            default_timeout: Duration::from_secs(30),
            compress_threshold: 8 * 1024,
        }
    }
}

/// Privacy shield severity selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PrivacyConfig {
    pub tracker_severity: Severity,
    pub cookie_severity: Severity,
    pub fingerprint_severity: Severity,
    /// Globally disables 0-RTT resumption for replay hardening.
    pub disable_zero_rtt: bool,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            tracker_severity: Severity::Standard,
            cookie_severity: Severity::Standard,
            fingerprint_severity: Severity::Standard,
            disable_zero_rtt: false,
        }
    }
}

/// The complete validated configuration handed to the supervisor.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub security_level: SecurityLevel,
    /// Explicit feature set; only consulted when `security_level` is Custom.
    pub security_features: HashSet<SecurityFeature>,
    /// Named network profile; `None` lets the optimizer pick from observation.
    pub network_profile: Option<String>,
    pub privacy: PrivacyConfig,
    pub compression: CompressionCacheConfig,
    pub dns: DnsConfig,
    pub ipc: IpcConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            security_level: SecurityLevel::Medium,
            security_features: HashSet::new(),
            network_profile: None,
            privacy: PrivacyConfig::default(),
            compression: CompressionCacheConfig::default(),
            dns: DnsConfig::default(),
            ipc: IpcConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Resolve the effective security feature set for this configuration.
    pub fn effective_security_features(&self) -> HashSet<SecurityFeature> {
        if self.security_level == SecurityLevel::Custom {
            self.security_features.clone()
        } else {
            self.security_level.features()
        }
    }

    /// Validate parameter combinations.
    ///
    /// Called exactly once at startup; every violation surfaces as a
    /// configuration error rather than failing piecemeal later.
    pub fn validate(&self) -> CoreResult<()> {
        if self.security_level == SecurityLevel::Custom && self.security_features.is_empty() {
            return Err(CoreError::Config(
                "security.level=custom requires a non-empty security.features list".into(),
            ));
        }
        if self.compression.max_bytes == 0 {
            return Err(CoreError::Config(
                "cache.compression.max_bytes must be non-zero".into(),
            ));
        }
        if self.compression.max_single_entry_bytes > self.compression.max_bytes {
            return Err(CoreError::Config(
                "cache.compression.max_single_entry_bytes exceeds max_bytes".into(),
            ));
        }
        if self.dns.cache_max_entries == 0 {
            return Err(CoreError::Config(
                "dns.cache.max_entries must be non-zero".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.dns.prefetch_threshold) {
            return Err(CoreError::Config(format!(
                "dns prefetch threshold {} outside [0, 1)",
                self.dns.prefetch_threshold
            )));
        }
        if self.dns.doh_endpoints.is_empty() && self.dns.dot_endpoints.is_empty() {
            return Err(CoreError::Config(
                "at least one DoH or DoT endpoint is required".into(),
            ));
        }
        if self.ipc.queue_size == 0 {
            return Err(CoreError::Config("ipc.queue_size must be non-zero".into()));
        }
        if self.ipc.heartbeat_interval < Duration::from_millis(100) {
            return Err(CoreError::Config(
                "ipc.heartbeat_ms below 100 ms would saturate channels".into(),
            ));
        }
        Ok(())
    }
}

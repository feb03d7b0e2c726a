//! # Network Optimizer
//!
//! Scores observed network state (bandwidth, RTT, loss, access type)
//! against a set of immutable transport profiles, selects the best fit
//! with hysteresis so marginal improvements do not cause flapping, and
//! derives the concrete HTTP/3 settings the client applies per
//! connection.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::net::congestion::CongestionAlgorithm;
use crate::net::http3::TransportParameters;
use crate::net::multipath::MultipathMode;

/// Access-network classification reported by the embedding host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    Ethernet,
    Wifi,
    Cellular,
    Satellite,
    Unknown,
}

/// One observation of the live network.
#[derive(Debug, Clone, Copy)]
pub struct ObservedNetwork {
    pub bandwidth_mbps: f64,
    pub rtt_ms: f64,
    pub loss_pct: f64,
    pub network_type: NetworkType,
}

/// An immutable bundle of transport knobs.
///
/// Profiles are snapshots: the optimizer never mutates one, it selects
/// among them and layers observation-derived tuning on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkProfile {
    pub name: String,
    /// The conditions this profile is shaped for.
    pub target_bandwidth_mbps: f64,
    pub target_rtt_ms: f64,
    pub target_loss_pct: f64,

    pub concurrent_connections: u32,
    pub max_streams_bidi: u64,
    pub socket_buffer_bytes: usize,
    pub congestion: CongestionAlgorithm,
    pub initial_max_data: u64,
    pub idle_timeout: Duration,
    pub retransmission_factor: f64,
    pub multipath: MultipathMode,
    pub pacing_enabled: bool,
    pub pacing_gain: f64,
    pub dns_providers: Vec<String>,
    pub dns_cache_entries: usize,
    pub http_cache_bytes: u64,
}

/// Observed loss below this floor is treated as this floor, so a profile
/// targeting 0.01% loss is not penalized against a lossless sample.
const LOSS_FLOOR_PCT: f64 = 0.05;

/// Minimum score margin before the optimizer abandons the active profile.
const DEFAULT_SWITCH_THRESHOLD: f64 = 0.3;

impl NetworkProfile {
    /// Weighted closeness of `observed` to this profile's targets.
    ///
    /// Each term is the symmetric ratio min(observed/target,
    /// target/observed), so overshoot and undershoot count the same;
    /// latency dominates at weight 0.5, bandwidth 0.3, loss 0.2.
    pub fn score(&self, observed: &ObservedNetwork) -> f64 {
        let bandwidth = symmetric_ratio(observed.bandwidth_mbps, self.target_bandwidth_mbps);
        let latency = symmetric_ratio(observed.rtt_ms, self.target_rtt_ms);
        let loss = symmetric_ratio(
            observed.loss_pct.max(LOSS_FLOOR_PCT),
            self.target_loss_pct.max(LOSS_FLOOR_PCT),
        );
        0.3 * bandwidth + 0.5 * latency + 0.2 * loss
    }
}

fn symmetric_ratio(observed: f64, target: f64) -> f64 {
    if observed <= 0.0 || target <= 0.0 {
        return 0.0;
    }
    (observed / target).min(target / observed)
}

/// Concrete per-connection settings derived from the active profile plus
/// the latest observation.
#[derive(Debug, Clone)]
pub struct Http3Settings {
    pub transport: TransportParameters,
    pub congestion: CongestionAlgorithm,
    pub multipath: MultipathMode,
    pub pacing_enabled: bool,
    pub pacing_gain: f64,
    pub retransmission_factor: f64,
    pub concurrent_connections: u32,
    pub socket_buffer_bytes: usize,
}

/// The built-in profile set.
pub fn builtin_profiles() -> Vec<Arc<NetworkProfile>> {
    let base_dns = vec![
        "https://cloudflare-dns.com/dns-query".to_string(),
        "https://dns.google/dns-query".to_string(),
    ];
    let profile = |name: &str,
                   bw: f64,
                   rtt: f64,
                   loss: f64,
                   connections: u32,
                   streams: u64,
                   congestion: CongestionAlgorithm,
                   multipath: MultipathMode,
                   pacing: bool| {
        Arc::new(NetworkProfile {
            name: name.to_string(),
            target_bandwidth_mbps: bw,
            target_rtt_ms: rtt,
            target_loss_pct: loss,
            concurrent_connections: connections,
            max_streams_bidi: streams,
            socket_buffer_bytes: 256 * 1024,
            congestion,
            initial_max_data: 1024 * 1024,
            idle_timeout: Duration::from_secs(30),
            retransmission_factor: 1.0,
            multipath,
            pacing_enabled: pacing,
            pacing_gain: 1.25,
            dns_providers: base_dns.clone(),
            dns_cache_entries: 4096,
            http_cache_bytes: 256 * 1024 * 1024,
        })
    };
    vec![
        profile(
            "wired",
            500.0,
            10.0,
            0.05,
            16,
            256,
            CongestionAlgorithm::Cubic,
            MultipathMode::Disabled,
            false,
        ),
        profile(
            "wifi-fast",
            200.0,
            20.0,
            0.1,
            12,
            128,
            CongestionAlgorithm::Cubic,
            MultipathMode::Aggregation,
            true,
        ),
        profile(
            "wifi-typical",
            50.0,
            40.0,
            0.5,
            8,
            64,
            CongestionAlgorithm::Cubic,
            MultipathMode::Dynamic,
            true,
        ),
        profile(
            "cellular-lte",
            25.0,
            60.0,
            1.0,
            6,
            32,
            CongestionAlgorithm::Bbr,
            MultipathMode::Handover,
            true,
        ),
        profile(
            "cellular-3g",
            2.0,
            150.0,
            2.0,
            3,
            12,
            CongestionAlgorithm::Bbr,
            MultipathMode::Handover,
            true,
        ),
        profile(
            "satellite",
            20.0,
            600.0,
            1.0,
            4,
            24,
            CongestionAlgorithm::Bbr,
            MultipathMode::Disabled,
            true,
        ),
    ]
}

/// Profile selection with hysteresis plus observation-derived tuning.
pub struct NetworkOptimizer {
    profiles: Vec<Arc<NetworkProfile>>,
    active: RwLock<Arc<NetworkProfile>>,
    settings: RwLock<Http3Settings>,
    switch_threshold: f64,
}

impl NetworkOptimizer {
    pub fn new() -> Self {
        Self::with_profiles(builtin_profiles())
    }

    pub fn with_profiles(profiles: Vec<Arc<NetworkProfile>>) -> Self {
        assert!(!profiles.is_empty(), "profile set must not be empty");
        let initial = profiles[0].clone();
        let settings = derive_settings(
            &initial,
            &ObservedNetwork {
                bandwidth_mbps: initial.target_bandwidth_mbps,
                rtt_ms: initial.target_rtt_ms,
                loss_pct: initial.target_loss_pct,
                network_type: NetworkType::Unknown,
            },
        );
        Self {
            profiles,
            active: RwLock::new(initial),
            settings: RwLock::new(settings),
            switch_threshold: DEFAULT_SWITCH_THRESHOLD,
        }
    }

    /// Pin the named profile, as configured via `network.profile`.
    pub fn activate_named(&self, name: &str) -> Option<Arc<NetworkProfile>> {
        let profile = self.profiles.iter().find(|p| p.name == name)?.clone();
        let observed = ObservedNetwork {
            bandwidth_mbps: profile.target_bandwidth_mbps,
            rtt_ms: profile.target_rtt_ms,
            loss_pct: profile.target_loss_pct,
            network_type: NetworkType::Unknown,
        };
        *self.settings.write() = derive_settings(&profile, &observed);
        *self.active.write() = profile.clone();
        Some(profile)
    }

    /// Best-scoring profile for the observation, without switching.
    pub fn choose_profile(&self, observed: &ObservedNetwork) -> Arc<NetworkProfile> {
        self.profiles
            .iter()
            .max_by(|a, b| {
                a.score(observed)
                    .partial_cmp(&b.score(observed))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
            .expect("profile set is non-empty")
    }

    /// Select (with hysteresis) and tune for the observation, returning
    /// the now-active profile.
    ///
    /// The active profile is only abandoned when the best candidate beats
    /// it by the switch threshold, suppressing flapping between adjacent
    /// profiles on noisy observations.
    pub fn optimize_for_observed(&self, observed: &ObservedNetwork) -> Arc<NetworkProfile> {
        let best = self.choose_profile(observed);
        let mut active = self.active.write();
        let active_score = active.score(observed);
        let best_score = best.score(observed);
        if best.name != active.name && best_score > active_score + self.switch_threshold {
            info!(
                from = %active.name,
                to = %best.name,
                from_score = format!("{active_score:.3}"),
                to_score = format!("{best_score:.3}"),
                "switching network profile"
            );
            *active = best;
        } else {
            debug!(
                active = %active.name,
                best = %best.name,
                "keeping active profile (margin below threshold)"
            );
        }
        let profile = active.clone();
        drop(active);
        *self.settings.write() = derive_settings(&profile, observed);
        profile
    }

    /// The settings the HTTP/3 client applies to new connections.
    pub fn get_active_http3_settings(&self) -> Http3Settings {
        self.settings.read().clone()
    }

    pub fn active_profile(&self) -> Arc<NetworkProfile> {
        self.active.read().clone()
    }
}

impl Default for NetworkOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapt profile knobs to the observation.
fn derive_settings(profile: &NetworkProfile, observed: &ObservedNetwork) -> Http3Settings {
    // Bandwidth-delay product in bytes: Mbps × ms × 125. The connection
    // cannot usefully buffer less than the pipe holds.
    let bdp = (observed.bandwidth_mbps.max(0.1) * observed.rtt_ms.max(1.0) * 125.0) as u64;
    let initial_max_data = bdp.max(128 * 1024);

    let max_ack_delay_ms = ((observed.rtt_ms / 10.0) as u64).clamp(1, 25);

    let retransmission_factor: f64 = if observed.loss_pct >= 5.0 {
        2.0
    } else if observed.loss_pct >= 1.0 {
        1.5
    } else {
        1.0
    };

    // Stream budget grows with bandwidth, bounded by the profile.
    let max_streams_bidi = ((observed.bandwidth_mbps * 2.0) as u64)
        .clamp(8, profile.max_streams_bidi.max(8));

    // Access-type pins override the profile's defaults.
    let (congestion, multipath) = match observed.network_type {
        NetworkType::Cellular => (CongestionAlgorithm::Bbr, MultipathMode::Handover),
        NetworkType::Ethernet if observed.bandwidth_mbps >= 50.0 => {
            (CongestionAlgorithm::Cubic, MultipathMode::Aggregation)
        }
        _ => (profile.congestion, profile.multipath),
    };

    Http3Settings {
        transport: TransportParameters {
            initial_max_data,
            initial_max_stream_data_bidi_local: initial_max_data / 4,
            initial_max_stream_data_bidi_remote: initial_max_data / 4,
            initial_max_stream_data_uni: initial_max_data / 8,
            initial_max_streams_bidi: max_streams_bidi,
            initial_max_streams_uni: max_streams_bidi / 2,
            max_idle_timeout: profile.idle_timeout,
            max_udp_payload_size: 1452,
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(max_ack_delay_ms),
            active_connection_id_limit: 4,
            disable_active_migration: multipath == MultipathMode::Disabled,
        },
        congestion,
        multipath,
        pacing_enabled: profile.pacing_enabled,
        pacing_gain: profile.pacing_gain,
        retransmission_factor: retransmission_factor.max(profile.retransmission_factor),
        concurrent_connections: profile.concurrent_connections,
        socket_buffer_bytes: profile.socket_buffer_bytes,
    }
}

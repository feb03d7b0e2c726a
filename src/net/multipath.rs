//! Multipath: one logical connection over several network paths.
//!
//! A connection may bind multiple underlying paths (Wi-Fi plus cellular,
//! say). The scheduler assigns stream packets to paths from per-path
//! congestion windows and RTT/bandwidth estimates; paths must pass
//! validation before carrying application data.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Multipath operating modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultipathMode {
    /// Single path.
    Disabled,
    /// One active path, others standby; switch on failure.
    Handover,
    /// All validated paths used concurrently.
    Aggregation,
    /// Choose between handover and aggregation from observed conditions.
    Dynamic,
}

/// Identifier of one path within a connection.
pub type PathId = u32;

/// Validation and usage state of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    /// Challenge sent, response outstanding.
    Probing,
    /// Challenge answered; eligible for scheduling.
    Validated,
    /// Declared unusable after loss or timeout.
    Failed,
}

/// One network path with its live estimates.
#[derive(Debug, Clone)]
pub struct NetworkPath {
    pub id: PathId,
    /// Human-readable interface description ("wlan0", "wwan0").
    pub interface: String,
    pub state: PathState,
    pub rtt: Duration,
    /// Estimated bytes per second.
    pub bandwidth: u64,
    /// Bytes currently in flight on this path.
    pub in_flight: u64,
    /// Per-path congestion window in bytes.
    pub cwnd: u64,
}

impl NetworkPath {
    pub fn new(id: PathId, interface: impl Into<String>) -> Self {
        Self {
            id,
            interface: interface.into(),
            state: PathState::Probing,
            rtt: Duration::from_millis(100),
            bandwidth: 0,
            in_flight: 0,
            cwnd: 12_000,
        }
    }

    fn has_capacity(&self, bytes: u64) -> bool {
        self.state == PathState::Validated && self.in_flight + bytes <= self.cwnd
    }
}

/// Packet-to-path scheduler for one connection.
pub struct PathScheduler {
    mode: MultipathMode,
    paths: Vec<NetworkPath>,
    /// Active path for handover mode.
    active: Option<PathId>,
}

impl PathScheduler {
    pub fn new(mode: MultipathMode) -> Self {
        Self {
            mode,
            paths: Vec::new(),
            active: None,
        }
    }

    pub fn mode(&self) -> MultipathMode {
        self.mode
    }

    pub fn add_path(&mut self, path: NetworkPath) {
        debug!(path = path.id, interface = %path.interface, "path added, probing");
        self.paths.push(path);
    }

    /// Complete path validation; the first validated path becomes active.
    pub fn mark_validated(&mut self, id: PathId) {
        if let Some(path) = self.paths.iter_mut().find(|p| p.id == id) {
            path.state = PathState::Validated;
            if self.active.is_none() {
                self.active = Some(id);
            }
        }
    }

    /// Fail a path; in handover mode the best standby takes over.
    pub fn mark_failed(&mut self, id: PathId) {
        if let Some(path) = self.paths.iter_mut().find(|p| p.id == id) {
            path.state = PathState::Failed;
            debug!(path = id, "path failed");
        }
        if self.active == Some(id) {
            self.active = self
                .paths
                .iter()
                .filter(|p| p.state == PathState::Validated)
                .max_by_key(|p| p.bandwidth)
                .map(|p| p.id);
            if let Some(new_active) = self.active {
                debug!(path = new_active, "handover to standby path");
            }
        }
    }

    pub fn record_estimates(&mut self, id: PathId, rtt: Duration, bandwidth: u64, cwnd: u64) {
        if let Some(path) = self.paths.iter_mut().find(|p| p.id == id) {
            path.rtt = rtt;
            path.bandwidth = bandwidth;
            path.cwnd = cwnd;
        }
    }

    pub fn on_sent(&mut self, id: PathId, bytes: u64) {
        if let Some(path) = self.paths.iter_mut().find(|p| p.id == id) {
            path.in_flight += bytes;
        }
    }

    pub fn on_acked(&mut self, id: PathId, bytes: u64) {
        if let Some(path) = self.paths.iter_mut().find(|p| p.id == id) {
            path.in_flight = path.in_flight.saturating_sub(bytes);
        }
    }

    /// Pick the path for the next `bytes`-sized packet, or `None` when
    /// every eligible path is congestion-limited.
    pub fn pick(&self, bytes: u64) -> Option<PathId> {
        match self.effective_mode() {
            MultipathMode::Disabled | MultipathMode::Handover => {
                let active = self.active?;
                self.paths
                    .iter()
                    .find(|p| p.id == active && p.has_capacity(bytes))
                    .map(|p| p.id)
            }
            MultipathMode::Aggregation | MultipathMode::Dynamic => self
                .paths
                .iter()
                .filter(|p| p.has_capacity(bytes))
                .max_by(|a, b| {
                    // Prefer high bandwidth, break ties on lower RTT.
                    a.bandwidth
                        .cmp(&b.bandwidth)
                        .then(b.rtt.cmp(&a.rtt))
                })
                .map(|p| p.id),
        }
    }

    /// Dynamic mode degrades to handover when the paths are too
    /// asymmetric for aggregation to help.
    fn effective_mode(&self) -> MultipathMode {
        if self.mode != MultipathMode::Dynamic {
            return self.mode;
        }
        let validated: Vec<&NetworkPath> = self
            .paths
            .iter()
            .filter(|p| p.state == PathState::Validated)
            .collect();
        if validated.len() < 2 {
            return MultipathMode::Handover;
        }
        let max_rtt = validated.iter().map(|p| p.rtt).max().unwrap_or_default();
        let min_rtt = validated
            .iter()
            .map(|p| p.rtt)
            .min()
            .unwrap_or(Duration::from_millis(1));
        // Beyond 4x RTT spread, reordering cost outweighs the capacity.
        if max_rtt.as_micros() > min_rtt.as_micros().saturating_mul(4) {
            MultipathMode::Handover
        } else {
            MultipathMode::Aggregation
        }
    }

    pub fn validated_count(&self) -> usize {
        self.paths
            .iter()
            .filter(|p| p.state == PathState::Validated)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_path_scheduler(mode: MultipathMode) -> PathScheduler {
        let mut scheduler = PathScheduler::new(mode);
        scheduler.add_path(NetworkPath::new(1, "wlan0"));
        scheduler.add_path(NetworkPath::new(2, "wwan0"));
        scheduler.mark_validated(1);
        scheduler.mark_validated(2);
        scheduler.record_estimates(1, Duration::from_millis(20), 10_000_000, 100_000);
        scheduler.record_estimates(2, Duration::from_millis(60), 2_000_000, 100_000);
        scheduler
    }

    #[test]
    fn unvalidated_paths_are_never_scheduled() {
        let mut scheduler = PathScheduler::new(MultipathMode::Aggregation);
        scheduler.add_path(NetworkPath::new(1, "wlan0"));
        assert_eq!(scheduler.pick(1200), None);
        scheduler.mark_validated(1);
        assert_eq!(scheduler.pick(1200), Some(1));
    }

    #[test]
    fn handover_sticks_to_active_until_failure() {
        let mut scheduler = two_path_scheduler(MultipathMode::Handover);
        assert_eq!(scheduler.pick(1200), Some(1));
        scheduler.mark_failed(1);
        assert_eq!(scheduler.pick(1200), Some(2));
    }

    #[test]
    fn aggregation_prefers_the_faster_path_until_it_fills() {
        let mut scheduler = two_path_scheduler(MultipathMode::Aggregation);
        assert_eq!(scheduler.pick(1200), Some(1));
        // Fill path 1's window; traffic spills to path 2.
        scheduler.on_sent(1, 100_000);
        assert_eq!(scheduler.pick(1200), Some(2));
    }

    #[test]
    fn dynamic_mode_degrades_to_handover_on_asymmetric_paths() {
        let mut scheduler = two_path_scheduler(MultipathMode::Dynamic);
        // 20 ms vs 60 ms is within 4x: aggregate.
        assert_eq!(scheduler.effective_mode(), MultipathMode::Aggregation);
        scheduler.record_estimates(2, Duration::from_millis(200), 2_000_000, 100_000);
        assert_eq!(scheduler.effective_mode(), MultipathMode::Handover);
    }
}

//! Pluggable congestion control for QUIC connections.
//!
//! Each controller is notified of ACKs, losses, and ECN marks, and
//! answers the one question the sender asks: how many bytes may be in
//! flight right now. Pacing is layered on top by the sender when the
//! active profile enables it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Closed set of congestion control algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CongestionAlgorithm {
    /// Loss-based, the fast-fixed-network default.
    Cubic,
    /// Model-based, pinned on cellular paths.
    Bbr,
    /// Delay-based variant for latency-sensitive traffic.
    LowLatency,
}

/// Max datagram payload assumed for window arithmetic.
const SEGMENT: u64 = 1200;
const INITIAL_WINDOW: u64 = 10 * SEGMENT;
const MIN_WINDOW: u64 = 2 * SEGMENT;

/// The verb set every algorithm implements.
pub trait CongestionController: Send + Sync {
    fn algorithm(&self) -> CongestionAlgorithm;

    /// Bytes newly acknowledged, with the sample RTT of the ack.
    fn on_ack(&mut self, bytes: u64, rtt: Duration);

    /// Bytes declared lost.
    fn on_loss(&mut self, bytes: u64);

    /// ECN congestion-experienced mark from the peer.
    fn on_ecn(&mut self);

    /// Allowed bytes in flight.
    fn window(&self) -> u64;

    /// Pacing rate in bytes per second, when the algorithm has an
    /// estimate worth pacing against.
    fn pacing_rate(&self) -> Option<u64>;
}

/// Construct the controller for `algorithm`.
pub fn build(algorithm: CongestionAlgorithm) -> Box<dyn CongestionController> {
    match algorithm {
        CongestionAlgorithm::Cubic => Box::new(Cubic::new()),
        CongestionAlgorithm::Bbr => Box::new(Bbr::new()),
        CongestionAlgorithm::LowLatency => Box::new(LowLatency::new()),
    }
}

/// CUBIC (RFC 8312): slow start to the threshold, then cubic growth
/// anchored at the window where the last loss happened.
pub struct Cubic {
    cwnd: u64,
    ssthresh: u64,
    w_max: f64,
    /// Seconds since the last loss epoch began.
    epoch_elapsed: f64,
}

impl Cubic {
    const C: f64 = 0.4;
    const BETA: f64 = 0.7;

    pub fn new() -> Self {
        Self {
            cwnd: INITIAL_WINDOW,
            ssthresh: u64::MAX,
            w_max: 0.0,
            epoch_elapsed: 0.0,
        }
    }
}

impl Default for Cubic {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionController for Cubic {
    fn algorithm(&self) -> CongestionAlgorithm {
        CongestionAlgorithm::Cubic
    }

    fn on_ack(&mut self, bytes: u64, rtt: Duration) {
        if self.cwnd < self.ssthresh {
            // Slow start.
            self.cwnd += bytes;
            return;
        }
        self.epoch_elapsed += rtt.as_secs_f64();
        let k = (self.w_max * (1.0 - Self::BETA) / Self::C).cbrt();
        let target =
            Self::C * (self.epoch_elapsed - k).powi(3) + self.w_max;
        let target_bytes = (target.max(0.0) * SEGMENT as f64) as u64;
        if target_bytes > self.cwnd {
            // Approach the cubic target one segment-fraction per ack.
            self.cwnd += ((target_bytes - self.cwnd) / self.cwnd.max(1)).max(1) * (bytes / SEGMENT).max(1);
        } else {
            self.cwnd += SEGMENT * bytes / (100 * self.cwnd.max(1)).max(1);
        }
    }

    fn on_loss(&mut self, _bytes: u64) {
        self.w_max = self.cwnd as f64 / SEGMENT as f64;
        self.cwnd = ((self.cwnd as f64 * Self::BETA) as u64).max(MIN_WINDOW);
        self.ssthresh = self.cwnd;
        self.epoch_elapsed = 0.0;
    }

    fn on_ecn(&mut self) {
        // ECN is treated as loss without retransmission cost.
        self.on_loss(0);
    }

    fn window(&self) -> u64 {
        self.cwnd
    }

    fn pacing_rate(&self) -> Option<u64> {
        None
    }
}

/// Simplified BBR: windowed max delivery rate and windowed min RTT give a
/// bandwidth-delay product; the window is a gain over that BDP.
pub struct Bbr {
    /// Recent delivery-rate samples, bytes per second.
    bw_samples: Vec<u64>,
    min_rtt: Duration,
    startup: bool,
    prior_bw: u64,
    plateau_rounds: u32,
}

impl Bbr {
    const STARTUP_GAIN: f64 = 2.885;
    const CWND_GAIN: f64 = 2.0;
    const BW_WINDOW: usize = 10;

    pub fn new() -> Self {
        Self {
            bw_samples: Vec::new(),
            min_rtt: Duration::from_millis(100),
            startup: true,
            prior_bw: 0,
            plateau_rounds: 0,
        }
    }

    fn bandwidth(&self) -> u64 {
        self.bw_samples.iter().copied().max().unwrap_or(0)
    }

    fn bdp(&self) -> u64 {
        (self.bandwidth() as f64 * self.min_rtt.as_secs_f64()) as u64
    }
}

impl Default for Bbr {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionController for Bbr {
    fn algorithm(&self) -> CongestionAlgorithm {
        CongestionAlgorithm::Bbr
    }

    fn on_ack(&mut self, bytes: u64, rtt: Duration) {
        if rtt < self.min_rtt {
            self.min_rtt = rtt;
        }
        let rate = (bytes as f64 / rtt.as_secs_f64().max(1e-6)) as u64;
        self.bw_samples.push(rate);
        if self.bw_samples.len() > Self::BW_WINDOW {
            self.bw_samples.remove(0);
        }
        if self.startup {
            // Leave startup after three rounds without bandwidth growth.
            let bw = self.bandwidth();
            if bw <= self.prior_bw + self.prior_bw / 4 {
                self.plateau_rounds += 1;
                if self.plateau_rounds >= 3 {
                    self.startup = false;
                }
            } else {
                self.plateau_rounds = 0;
                self.prior_bw = bw;
            }
        }
    }

    fn on_loss(&mut self, _bytes: u64) {
        // BBR does not react to isolated loss; a persistent lossy link
        // shows up as a lower delivery rate.
    }

    fn on_ecn(&mut self) {}

    fn window(&self) -> u64 {
        let gain = if self.startup {
            Self::STARTUP_GAIN
        } else {
            Self::CWND_GAIN
        };
        ((self.bdp() as f64 * gain) as u64).max(INITIAL_WINDOW)
    }

    fn pacing_rate(&self) -> Option<u64> {
        let bw = self.bandwidth();
        (bw > 0).then(|| {
            let gain = if self.startup { Self::STARTUP_GAIN } else { 1.0 };
            (bw as f64 * gain) as u64
        })
    }
}

/// Delay-based controller: backs off as soon as the smoothed RTT rises a
/// quarter over the observed floor, keeping queues short.
pub struct LowLatency {
    cwnd: u64,
    min_rtt: Duration,
    smoothed_rtt: Duration,
}

impl LowLatency {
    const RTT_SLACK: f64 = 1.25;

    pub fn new() -> Self {
        Self {
            cwnd: INITIAL_WINDOW,
            min_rtt: Duration::from_secs(3600),
            smoothed_rtt: Duration::ZERO,
        }
    }
}

impl Default for LowLatency {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionController for LowLatency {
    fn algorithm(&self) -> CongestionAlgorithm {
        CongestionAlgorithm::LowLatency
    }

    fn on_ack(&mut self, bytes: u64, rtt: Duration) {
        if rtt < self.min_rtt {
            self.min_rtt = rtt;
        }
        self.smoothed_rtt = if self.smoothed_rtt.is_zero() {
            rtt
        } else {
            (self.smoothed_rtt * 7 + rtt) / 8
        };
        let threshold = self.min_rtt.as_secs_f64() * Self::RTT_SLACK;
        if self.smoothed_rtt.as_secs_f64() > threshold {
            self.cwnd = (self.cwnd - (self.cwnd / 8)).max(MIN_WINDOW);
        } else {
            self.cwnd += bytes.min(SEGMENT);
        }
    }

    fn on_loss(&mut self, _bytes: u64) {
        self.cwnd = (self.cwnd / 2).max(MIN_WINDOW);
    }

    fn on_ecn(&mut self) {
        self.cwnd = (self.cwnd - (self.cwnd / 8)).max(MIN_WINDOW);
    }

    fn window(&self) -> u64 {
        self.cwnd
    }

    fn pacing_rate(&self) -> Option<u64> {
        if self.smoothed_rtt.is_zero() {
            return None;
        }
        Some((self.cwnd as f64 / self.smoothed_rtt.as_secs_f64()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cubic_grows_in_slow_start_and_halves_on_loss() {
        let mut cubic = Cubic::new();
        let start = cubic.window();
        for _ in 0..10 {
            cubic.on_ack(SEGMENT, Duration::from_millis(20));
        }
        assert!(cubic.window() > start);

        let before_loss = cubic.window();
        cubic.on_loss(SEGMENT);
        assert!(cubic.window() < before_loss);
        assert!(cubic.window() >= MIN_WINDOW);
    }

    #[test]
    fn cubic_recovers_after_loss() {
        let mut cubic = Cubic::new();
        for _ in 0..20 {
            cubic.on_ack(SEGMENT, Duration::from_millis(20));
        }
        cubic.on_loss(SEGMENT);
        let floor = cubic.window();
        for _ in 0..200 {
            cubic.on_ack(SEGMENT, Duration::from_millis(20));
        }
        assert!(cubic.window() > floor);
    }

    #[test]
    fn bbr_window_tracks_bandwidth_delay_product() {
        let mut bbr = Bbr::new();
        // 1 MB/s at 50 ms: BDP = 50 KB.
        for _ in 0..20 {
            bbr.on_ack(50_000, Duration::from_millis(50));
        }
        let window = bbr.window();
        assert!(window >= 50_000, "window {window} below BDP");
        assert!(bbr.pacing_rate().unwrap() > 0);
    }

    #[test]
    fn bbr_ignores_isolated_loss() {
        let mut bbr = Bbr::new();
        for _ in 0..10 {
            bbr.on_ack(50_000, Duration::from_millis(50));
        }
        let before = bbr.window();
        bbr.on_loss(SEGMENT);
        assert_eq!(bbr.window(), before);
    }

    #[test]
    fn low_latency_backs_off_when_rtt_inflates() {
        let mut controller = LowLatency::new();
        for _ in 0..50 {
            controller.on_ack(SEGMENT, Duration::from_millis(10));
        }
        let before = controller.window();
        // Queue building: RTT doubles over the floor.
        for _ in 0..20 {
            controller.on_ack(SEGMENT, Duration::from_millis(40));
        }
        assert!(controller.window() < before);
    }
}

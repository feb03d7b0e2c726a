//! # Nimbus Engine Core
//!
//! The core subsystems of a multi-process web engine: a typed IPC fabric
//! over pluggable transports, an HTTP/3-first network stack with an
//! adaptive optimizer and caching DNS resolver, a multi-algorithm
//! compression cache, and a privacy shield that classifies and rewrites
//! requests, cookies, ICE candidates, and fingerprint surfaces.
//!
//! Parsing, layout, script execution, rendering, and the UI are external
//! collaborators reached only through the interface contracts exposed
//! here.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod net;
pub mod persist;
pub mod privacy;
pub mod supervisor;

pub use cache::CompressionCache;
pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
pub use ipc::{IpcFabric, Message};
pub use net::dns::DnsResolver;
pub use net::http3::Http3Client;
pub use net::optimizer::NetworkOptimizer;
pub use privacy::PrivacyShield;
pub use supervisor::ProcessSupervisor;

/// The current version of the engine core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Nanoseconds since the Unix epoch.
///
/// Falls back to 0 rather than panicking if the system clock is before
/// the epoch.
pub fn now_unix_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Default configuration values shared by the CLI and embedding hosts.
pub mod defaults {
    use std::time::Duration;

    /// Default IPC heartbeat interval.
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

    /// Default `send_and_await` deadline.
    pub const IPC_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default compression cache capacity.
    pub const COMPRESSION_CACHE_BYTES: u64 = 256 * 1024 * 1024;

    /// Default DNS cache capacity in entries.
    pub const DNS_CACHE_ENTRIES: usize = 4096;

    /// Elapsed-TTL fraction that triggers DNS prefetch.
    pub const DNS_PREFETCH_THRESHOLD: f64 = 0.8;
}

//! # Caching DNS Resolver
//!
//! Hostname resolution with positive and negative caching, LRU eviction,
//! TTL-threshold prefetch, and a rotating upstream set with per-query
//! timeouts and bounded retries.
//!
//! The secure-transport handshake behind a DoH or DoT upstream belongs to
//! the embedding host's TLS stack; upstreams plug in through the
//! [`DnsUpstream`] trait, and the resolver owns selection, rotation,
//! fallback, caching, and expiry. A system upstream backed by the OS
//! resolver ships in-tree.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::DnsConfig;
use crate::error::{CoreError, CoreResult, NetworkErrorKind};

/// Record types the resolver answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    /// IPv4 address.
    A,
    /// IPv6 address.
    Aaaa,
    Cname,
    Txt,
}

/// One cached answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRecord {
    pub hostname: String,
    pub record_type: RecordType,
    /// Textual record data: an address for A/AAAA, a name for CNAME.
    pub value: String,
    pub ttl: Duration,
    /// When the answer was observed, nanoseconds since the Unix epoch.
    pub observed_ns: u64,
}

impl DnsRecord {
    /// Fraction of the TTL that has elapsed, ≥ 1.0 once expired.
    pub fn elapsed_fraction(&self) -> f64 {
        let age_ns = crate::now_unix_ns().saturating_sub(self.observed_ns);
        let ttl_ns = self.ttl.as_nanos().max(1) as u64;
        age_ns as f64 / ttl_ns as f64
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed_fraction() >= 1.0
    }
}

/// How an upstream reaches its resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    /// OS resolver; no transport policy applies.
    System,
    /// DNS over authenticated HTTPS.
    DoH,
    /// DNS over authenticated TLS.
    DoT,
}

/// An upstream resolver endpoint.
#[async_trait]
pub trait DnsUpstream: Send + Sync {
    fn kind(&self) -> UpstreamKind;

    /// Endpoint description for logs and diagnostics.
    fn descriptor(&self) -> &str;

    async fn query(&self, hostname: &str, record_type: RecordType) -> CoreResult<Vec<DnsRecord>>;
}

/// Upstream backed by the operating system resolver.
pub struct SystemUpstream {
    default_ttl: Duration,
}

impl SystemUpstream {
    pub fn new(default_ttl: Duration) -> Self {
        Self { default_ttl }
    }
}

#[async_trait]
impl DnsUpstream for SystemUpstream {
    fn kind(&self) -> UpstreamKind {
        UpstreamKind::System
    }

    fn descriptor(&self) -> &str {
        "system"
    }

    async fn query(&self, hostname: &str, record_type: RecordType) -> CoreResult<Vec<DnsRecord>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((hostname, 0u16))
            .await
            .map_err(|e| {
                CoreError::transient(NetworkErrorKind::DnsFailure, format!("{hostname}: {e}"))
            })?
            .collect();
        let now = crate::now_unix_ns();
        let records: Vec<DnsRecord> = addrs
            .into_iter()
            .filter(|addr| match record_type {
                RecordType::A => addr.is_ipv4(),
                RecordType::Aaaa => addr.is_ipv6(),
                _ => false,
            })
            .map(|addr| DnsRecord {
                hostname: hostname.to_string(),
                record_type,
                value: addr.ip().to_string(),
                ttl: self.default_ttl,
                observed_ns: now,
            })
            .collect();
        if records.is_empty() {
            return Err(CoreError::network_fatal(
                NetworkErrorKind::DnsFailure,
                format!("no {record_type:?} records for {hostname}"),
            ));
        }
        Ok(records)
    }
}

#[derive(Clone)]
struct CachedSet {
    records: Vec<DnsRecord>,
    /// NXDOMAIN / SERVFAIL cached under the shorter negative TTL.
    negative: bool,
    observed_ns: u64,
    ttl: Duration,
}

impl CachedSet {
    fn is_expired(&self) -> bool {
        let age_ns = crate::now_unix_ns().saturating_sub(self.observed_ns);
        age_ns >= self.ttl.as_nanos() as u64
    }
}

struct HostEntry {
    by_type: HashMap<RecordType, CachedSet>,
    last_access_ns: u64,
    access_count: u64,
}

/// Resolver statistics counters.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DnsStats {
    pub hits: u64,
    pub misses: u64,
    pub negative_hits: u64,
    pub prefetches: u64,
    pub evictions: u64,
}

/// The caching resolver.
pub struct DnsResolver {
    config: DnsConfig,
    cache: DashMap<String, HostEntry>,
    upstreams: Vec<Arc<dyn DnsUpstream>>,
    rotation: AtomicUsize,
    refreshing: Arc<DashSet<(String, RecordType)>>,
    hits: AtomicU64,
    misses: AtomicU64,
    negative_hits: AtomicU64,
    prefetches: AtomicU64,
    evictions: AtomicU64,
}

impl DnsResolver {
    /// Build a resolver over an explicit upstream set.
    ///
    /// Secure-DNS policy is applied here: when any DoH or DoT upstream is
    /// present, the plain system upstream is consulted only after every
    /// secure upstream has failed.
    pub fn new(config: DnsConfig, mut upstreams: Vec<Arc<dyn DnsUpstream>>) -> Arc<Self> {
        upstreams.sort_by_key(|u| match u.kind() {
            UpstreamKind::DoH => 0,
            UpstreamKind::DoT => 1,
            UpstreamKind::System => 2,
        });
        Arc::new(Self {
            config,
            cache: DashMap::new(),
            upstreams,
            rotation: AtomicUsize::new(0),
            refreshing: Arc::new(DashSet::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            negative_hits: AtomicU64::new(0),
            prefetches: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Resolver with the in-tree system upstream only.
    pub fn with_system_upstream(config: DnsConfig) -> Arc<Self> {
        let upstream: Arc<dyn DnsUpstream> = Arc::new(SystemUpstream::new(config.default_ttl));
        Self::new(config, vec![upstream])
    }

    /// Resolve `hostname` to records of `record_type`.
    ///
    /// An unexpired cached answer is returned immediately; when its
    /// elapsed-TTL fraction has crossed the prefetch threshold a
    /// background refresh is scheduled and the current answer stays
    /// usable until the refresh lands.
    pub async fn resolve(
        self: &Arc<Self>,
        hostname: &str,
        record_type: RecordType,
    ) -> CoreResult<Vec<DnsRecord>> {
        if let Some(cached) = self.cache_lookup(hostname, record_type) {
            if cached.negative {
                self.negative_hits.fetch_add(1, Ordering::Relaxed);
                return Err(CoreError::network_fatal(
                    NetworkErrorKind::DnsFailure,
                    format!("{hostname} negatively cached"),
                ));
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            let fraction = crate::now_unix_ns().saturating_sub(cached.observed_ns) as f64
                / cached.ttl.as_nanos().max(1) as f64;
            if fraction >= self.config.prefetch_threshold {
                self.spawn_prefetch(hostname.to_string(), record_type);
            }
            return Ok(cached.records);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        match self.query_upstreams(hostname, record_type).await {
            Ok(records) => {
                self.insert(hostname, record_type, records.clone(), false);
                Ok(records)
            }
            Err(err) => {
                // NXDOMAIN-shaped failures are cached under the negative
                // TTL so repeat lookups do not hammer the upstreams.
                if !err.is_retryable() {
                    self.insert(hostname, record_type, Vec::new(), true);
                }
                Err(err)
            }
        }
    }

    /// Current counter snapshot.
    pub fn stats(&self) -> DnsStats {
        DnsStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            prefetches: self.prefetches.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Remove expired positive and negative entries. Called periodically
    /// by the supervisor's maintenance task.
    pub fn sweep_expired(&self) {
        let mut emptied = Vec::new();
        for mut entry in self.cache.iter_mut() {
            entry.value_mut().by_type.retain(|_, set| !set.is_expired());
            if entry.value().by_type.is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for hostname in emptied {
            self.cache
                .remove_if(&hostname, |_, entry| entry.by_type.is_empty());
        }
    }

    /// Export every live record for persistence.
    pub fn snapshot(&self) -> Vec<DnsRecord> {
        let mut records = Vec::new();
        for entry in self.cache.iter() {
            for set in entry.value().by_type.values() {
                if !set.negative && !set.is_expired() {
                    records.extend(set.records.iter().cloned());
                }
            }
        }
        records
    }

    /// Seed the cache from persisted records, skipping expired ones.
    pub fn restore(&self, records: Vec<DnsRecord>) {
        for record in records {
            if record.is_expired() {
                continue;
            }
            let hostname = record.hostname.clone();
            let record_type = record.record_type;
            let observed_ns = record.observed_ns;
            let ttl = record.ttl;
            let mut entry = self.cache.entry(hostname).or_insert_with(|| HostEntry {
                by_type: HashMap::new(),
                last_access_ns: crate::now_unix_ns(),
                access_count: 0,
            });
            entry
                .by_type
                .entry(record_type)
                .or_insert_with(|| CachedSet {
                    records: Vec::new(),
                    negative: false,
                    observed_ns,
                    ttl,
                })
                .records
                .push(record);
        }
    }

    fn cache_lookup(&self, hostname: &str, record_type: RecordType) -> Option<CachedSet> {
        let mut entry = self.cache.get_mut(hostname)?;
        let now = crate::now_unix_ns();
        entry.last_access_ns = now;
        entry.access_count += 1;
        let set = entry.by_type.get(&record_type)?;
        if set.is_expired() {
            return None;
        }
        Some(set.clone())
    }

    fn insert(&self, hostname: &str, record_type: RecordType, records: Vec<DnsRecord>, negative: bool) {
        let ttl = if negative {
            self.config.negative_ttl
        } else {
            records.first().map(|r| r.ttl).unwrap_or(self.config.default_ttl)
        };
        let now = crate::now_unix_ns();
        let mut entry = self
            .cache
            .entry(hostname.to_string())
            .or_insert_with(|| HostEntry {
                by_type: HashMap::new(),
                last_access_ns: now,
                access_count: 0,
            });
        entry.by_type.insert(
            record_type,
            CachedSet {
                records,
                negative,
                observed_ns: now,
                ttl,
            },
        );
        drop(entry);
        self.evict_if_needed();
    }

    /// LRU eviction down to the configured entry bound.
    fn evict_if_needed(&self) {
        while self.cache.len() > self.config.cache_max_entries {
            let oldest = self
                .cache
                .iter()
                .min_by_key(|e| e.value().last_access_ns)
                .map(|e| e.key().clone());
            match oldest {
                Some(hostname) => {
                    self.cache.remove(&hostname);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!("dns cache evicted {hostname}");
                }
                None => break,
            }
        }
    }

    fn spawn_prefetch(self: &Arc<Self>, hostname: String, record_type: RecordType) {
        let key = (hostname.clone(), record_type);
        if !self.refreshing.insert(key.clone()) {
            return;
        }
        self.prefetches.fetch_add(1, Ordering::Relaxed);
        let resolver = self.clone();
        tokio::spawn(async move {
            debug!("dns prefetch for {}", key.0);
            match resolver.query_upstreams(&key.0, record_type).await {
                Ok(records) => resolver.insert(&key.0, record_type, records, false),
                Err(e) => debug!("dns prefetch for {} failed: {e}", key.0),
            }
            resolver.refreshing.remove(&key);
        });
    }

    /// Try upstreams in rotation with a per-query timeout, falling back
    /// on the next endpoint up to the bounded retry count.
    async fn query_upstreams(
        &self,
        hostname: &str,
        record_type: RecordType,
    ) -> CoreResult<Vec<DnsRecord>> {
        if self.upstreams.is_empty() {
            return Err(CoreError::Config("no DNS upstreams configured".into()));
        }
        let start = self.rotation.fetch_add(1, Ordering::Relaxed);
        let attempts = (self.config.max_retries as usize + 1).min(self.upstreams.len().max(1));
        let mut last_err = None;
        for i in 0..attempts {
            let upstream = &self.upstreams[(start + i) % self.upstreams.len()];
            match tokio::time::timeout(
                self.config.query_timeout,
                upstream.query(hostname, record_type),
            )
            .await
            {
                Ok(Ok(records)) => return Ok(records),
                Ok(Err(e)) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    warn!(
                        "dns upstream {} failed for {hostname}: {e}",
                        upstream.descriptor()
                    );
                    last_err = Some(e);
                }
                Err(_) => {
                    warn!(
                        "dns upstream {} timed out for {hostname}",
                        upstream.descriptor()
                    );
                    last_err = Some(CoreError::transient(
                        NetworkErrorKind::TimedOut,
                        format!("dns query for {hostname} timed out"),
                    ));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            CoreError::transient(NetworkErrorKind::DnsFailure, hostname.to_string())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Scripted upstream answering from a fixed table and counting calls.
    struct ScriptedUpstream {
        answers: Mutex<HashMap<String, Vec<String>>>,
        calls: AtomicU64,
        ttl: Duration,
    }

    impl ScriptedUpstream {
        fn new(ttl: Duration) -> Self {
            Self {
                answers: Mutex::new(HashMap::new()),
                calls: AtomicU64::new(0),
                ttl,
            }
        }

        fn answer(&self, hostname: &str, addrs: &[&str]) {
            self.answers.lock().insert(
                hostname.to_string(),
                addrs.iter().map(|s| s.to_string()).collect(),
            );
        }
    }

    #[async_trait]
    impl DnsUpstream for ScriptedUpstream {
        fn kind(&self) -> UpstreamKind {
            UpstreamKind::DoH
        }

        fn descriptor(&self) -> &str {
            "scripted"
        }

        async fn query(&self, hostname: &str, record_type: RecordType) -> CoreResult<Vec<DnsRecord>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let answers = self.answers.lock();
            match answers.get(hostname) {
                Some(addrs) => Ok(addrs
                    .iter()
                    .map(|addr| DnsRecord {
                        hostname: hostname.to_string(),
                        record_type,
                        value: addr.clone(),
                        ttl: self.ttl,
                        observed_ns: crate::now_unix_ns(),
                    })
                    .collect()),
                None => Err(CoreError::network_fatal(
                    NetworkErrorKind::DnsFailure,
                    format!("NXDOMAIN {hostname}"),
                )),
            }
        }
    }

    fn test_config() -> DnsConfig {
        DnsConfig {
            cache_max_entries: 4,
            default_ttl: Duration::from_secs(100),
            negative_ttl: Duration::from_millis(200),
            prefetch_threshold: 0.8,
            query_timeout: Duration::from_millis(500),
            max_retries: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let upstream = Arc::new(ScriptedUpstream::new(Duration::from_secs(100)));
        upstream.answer("example.test", &["203.0.113.5"]);
        let resolver = DnsResolver::new(test_config(), vec![upstream.clone()]);

        let first = resolver.resolve("example.test", RecordType::A).await.unwrap();
        assert_eq!(first[0].value, "203.0.113.5");
        let second = resolver.resolve("example.test", RecordType::A).await.unwrap();
        assert_eq!(second[0].value, "203.0.113.5");
        assert_eq!(upstream.calls.load(Ordering::Relaxed), 1);
        assert_eq!(resolver.stats().hits, 1);
    }

    #[tokio::test]
    async fn returned_records_are_within_ttl() {
        let upstream = Arc::new(ScriptedUpstream::new(Duration::from_secs(100)));
        upstream.answer("fresh.test", &["198.51.100.1"]);
        let resolver = DnsResolver::new(test_config(), vec![upstream]);
        let records = resolver.resolve("fresh.test", RecordType::A).await.unwrap();
        for record in records {
            assert!(!record.is_expired());
            assert!(record.elapsed_fraction() < 1.0);
        }
    }

    #[tokio::test]
    async fn crossing_the_prefetch_threshold_refreshes_in_background() {
        let upstream = Arc::new(ScriptedUpstream::new(Duration::from_millis(200)));
        upstream.answer("prefetch.test", &["203.0.113.9"]);
        let resolver = DnsResolver::new(test_config(), vec![upstream.clone()]);

        resolver
            .resolve("prefetch.test", RecordType::A)
            .await
            .unwrap();
        let observed_before = resolver.snapshot()[0].observed_ns;

        // Sit just past 80% of the 200 ms TTL, then look up again: the
        // answer must come back instantly from cache while a refresh runs.
        tokio::time::sleep(Duration::from_millis(170)).await;
        let cached = resolver
            .resolve("prefetch.test", RecordType::A)
            .await
            .unwrap();
        assert_eq!(cached[0].observed_ns, observed_before);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(upstream.calls.load(Ordering::Relaxed), 2);
        let refreshed = resolver.snapshot();
        assert!(refreshed[0].observed_ns > observed_before);
        assert_eq!(resolver.stats().prefetches, 1);
    }

    #[tokio::test]
    async fn negative_answers_are_cached_briefly() {
        let upstream = Arc::new(ScriptedUpstream::new(Duration::from_secs(100)));
        let resolver = DnsResolver::new(test_config(), vec![upstream.clone()]);

        assert!(resolver.resolve("missing.test", RecordType::A).await.is_err());
        assert!(resolver.resolve("missing.test", RecordType::A).await.is_err());
        // Second failure came from the negative cache, not the upstream.
        assert_eq!(upstream.calls.load(Ordering::Relaxed), 1);
        assert_eq!(resolver.stats().negative_hits, 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(resolver.resolve("missing.test", RecordType::A).await.is_err());
        assert_eq!(upstream.calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn eviction_removes_least_recently_used_hostname() {
        let upstream = Arc::new(ScriptedUpstream::new(Duration::from_secs(100)));
        for i in 0..6 {
            upstream.answer(&format!("host{i}.test"), &["192.0.2.1"]);
        }
        let resolver = DnsResolver::new(test_config(), vec![upstream]);

        for i in 0..5 {
            resolver
                .resolve(&format!("host{i}.test"), RecordType::A)
                .await
                .unwrap();
            // Distinct access stamps for deterministic LRU order.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Capacity is 4, so host0 (oldest) must be gone.
        assert!(resolver.stats().evictions >= 1);
        let cached: Vec<String> = resolver
            .snapshot()
            .into_iter()
            .map(|r| r.hostname)
            .collect();
        assert!(!cached.contains(&"host0.test".to_string()));
    }
}

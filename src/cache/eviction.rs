//! Eviction policies for the compression cache.
//!
//! Victim selection runs over a snapshot of entry metadata, so no lock is
//! held while scoring; removal happens afterwards through the store.

use dashmap::DashMap;
use std::time::Duration;

use crate::cache::{CacheEntry, CacheKey};
use crate::config::EvictionPolicy;

struct Candidate {
    key: CacheKey,
    size: u64,
    created_ns: u64,
    last_access_ns: u64,
    access_count: u64,
    expired: bool,
}

/// Keys of entries whose TTL has elapsed.
pub fn expired_keys(entries: &DashMap<CacheKey, CacheEntry>, ttl: Duration) -> Vec<CacheKey> {
    let now = crate::now_unix_ns();
    let ttl_ns = ttl.as_nanos() as u64;
    entries
        .iter()
        .filter(|e| now.saturating_sub(e.value().created_ns) > ttl_ns)
        .map(|e| *e.key())
        .collect()
}

/// Pick victims under `policy` until at least `target_bytes` would be
/// freed.
pub fn select_victims(
    policy: EvictionPolicy,
    entries: &DashMap<CacheKey, CacheEntry>,
    ttl: Duration,
    target_bytes: u64,
) -> Vec<CacheKey> {
    let now = crate::now_unix_ns();
    let ttl_ns = ttl.as_nanos() as u64;
    let mut candidates: Vec<Candidate> = entries
        .iter()
        .map(|e| {
            let entry = e.value();
            Candidate {
                key: entry.key,
                size: entry.compressed.len() as u64,
                created_ns: entry.created_ns,
                last_access_ns: entry.last_access_ns,
                access_count: entry.access_count,
                expired: now.saturating_sub(entry.created_ns) > ttl_ns,
            }
        })
        .collect();

    match policy {
        EvictionPolicy::Lru => {
            candidates.sort_by_key(|c| c.last_access_ns);
        }
        EvictionPolicy::Lfu => {
            candidates.sort_by_key(|c| (c.access_count, c.last_access_ns));
        }
        EvictionPolicy::Ttl => {
            // Expired first, then oldest by creation.
            candidates.sort_by_key(|c| (!c.expired, c.created_ns));
        }
        EvictionPolicy::Hybrid => {
            candidates.sort_by(|a, b| {
                match (a.expired, b.expired) {
                    (true, false) => return std::cmp::Ordering::Less,
                    (false, true) => return std::cmp::Ordering::Greater,
                    _ => {}
                }
                hybrid_score(a, now)
                    .partial_cmp(&hybrid_score(b, now))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
    }

    let mut victims = Vec::new();
    let mut freed = 0u64;
    for candidate in candidates {
        if freed >= target_bytes {
            break;
        }
        freed += candidate.size;
        victims.push(candidate.key);
    }
    victims
}

/// Access frequency over hours since last access; low scores evict first.
fn hybrid_score(candidate: &Candidate, now: u64) -> f64 {
    let idle_hours =
        (now.saturating_sub(candidate.last_access_ns) as f64 / 3.6e12).max(1.0 / 3600.0);
    candidate.access_count as f64 / idle_hours
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::engine::{CompressionAlgorithm, ContentHint};

    fn entry(key_byte: u8, size: usize, created_ns: u64, last_access_ns: u64, access_count: u64) -> CacheEntry {
        let mut key = [0u8; 32];
        key[0] = key_byte;
        CacheEntry {
            key,
            compressed: vec![0; size],
            original_size: size as u64 * 2,
            algorithm: CompressionAlgorithm::Zstd,
            ratio: 0.5,
            content_hint: ContentHint::Binary,
            content_hash: [0; 32],
            created_ns,
            last_access_ns,
            access_count,
        }
    }

    fn store(entries: Vec<CacheEntry>) -> DashMap<CacheKey, CacheEntry> {
        let map = DashMap::new();
        for e in entries {
            map.insert(e.key, e);
        }
        map
    }

    #[test]
    fn lru_evicts_the_least_recently_accessed() {
        let now = crate::now_unix_ns();
        let map = store(vec![
            entry(1, 100, now, now - 3_000_000_000, 10),
            entry(2, 100, now, now - 1_000_000_000, 1),
        ]);
        let victims = select_victims(EvictionPolicy::Lru, &map, Duration::from_secs(3600), 50);
        assert_eq!(victims[0][0], 1);
    }

    #[test]
    fn lfu_evicts_the_least_frequently_accessed() {
        let now = crate::now_unix_ns();
        let map = store(vec![
            entry(1, 100, now, now, 50),
            entry(2, 100, now, now, 2),
        ]);
        let victims = select_victims(EvictionPolicy::Lfu, &map, Duration::from_secs(3600), 50);
        assert_eq!(victims[0][0], 2);
    }

    #[test]
    fn ttl_evicts_expired_before_fresh() {
        let now = crate::now_unix_ns();
        let hour_ns = 3_600_000_000_000u64;
        let map = store(vec![
            entry(1, 100, now - 10_000, now, 1),     // fresh
            entry(2, 100, now - 2 * hour_ns, now, 99), // expired despite heavy use
        ]);
        let victims = select_victims(EvictionPolicy::Ttl, &map, Duration::from_secs(3600), 50);
        assert_eq!(victims[0][0], 2);
    }

    #[test]
    fn hybrid_prefers_stale_and_rarely_used() {
        let now = crate::now_unix_ns();
        let hour_ns = 3_600_000_000_000u64;
        let map = store(vec![
            // Hot: many accesses, touched seconds ago.
            entry(1, 100, now - hour_ns / 2, now - 1_000_000_000, 200),
            // Cold: few accesses, untouched for most of an hour.
            entry(2, 100, now - hour_ns / 2, now - hour_ns / 2, 2),
        ]);
        let victims = select_victims(EvictionPolicy::Hybrid, &map, Duration::from_secs(7200), 50);
        assert_eq!(victims[0][0], 2);
    }

    #[test]
    fn selection_frees_at_least_the_target() {
        let now = crate::now_unix_ns();
        let map = store((0..10).map(|i| entry(i, 1000, now, now - i as u64, 1)).collect());
        let victims = select_victims(EvictionPolicy::Lru, &map, Duration::from_secs(3600), 3500);
        assert_eq!(victims.len(), 4);
    }
}

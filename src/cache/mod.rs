//! # Compression Engine and Content-Addressed Cache
//!
//! Multi-algorithm compression with content-addressed caching, predictive
//! reuse via pattern signatures, and selectable eviction policies.
//!
//! ## Key Design Principles
//!
//! - **Self-describing output**: every compressed buffer carries a small
//!   container header naming the algorithm, so decompression is the
//!   formal inverse of compression with no side channel
//! - **Sampled fingerprints**: cache keys hash the first, middle, and
//!   last 4 KiB plus the total length, so keying large inputs stays
//!   cheap
//! - **Verified prediction**: signature matches only short-circuit work
//!   after full-content verification, never on similarity alone
//! - **Bounded**: total cached bytes respect the configured maximum;
//!   eviction frees at least a tenth of capacity per pass
//!
//! Heavy codec work runs on the dedicated worker pool, keeping blocking
//! compression off the async runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CompressionCacheConfig;
use crate::error::{CoreError, CoreResult};
use crate::ipc::Priority;

pub mod engine;
pub mod eviction;
pub mod pool;

pub use engine::{infer_content_hint, CompressionAlgorithm, ContentHint};
pub use pool::{CompressionPool, JobHandle};

/// Content-addressed cache key: sampled fingerprint ⊕ algorithm ⊕ level.
pub type CacheKey = [u8; 32];

/// One cached compression result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub compressed: Vec<u8>,
    pub original_size: u64,
    pub algorithm: CompressionAlgorithm,
    /// compressed / original, below 1.0 when compression helped.
    pub ratio: f64,
    pub content_hint: ContentHint,
    /// Full-content hash used to verify predictive matches.
    pub content_hash: [u8; 32],
    pub created_ns: u64,
    pub last_access_ns: u64,
    pub access_count: u64,
}

/// Aggregate statistics for one cache instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub predictive_hits: u64,
    pub compressions: u64,
    pub decompressions: u64,
    pub evictions: u64,
    pub bytes_saved: u64,
}

/// The compression cache: engine, store, signatures, and worker pool.
pub struct CompressionCache {
    config: CompressionCacheConfig,
    entries: DashMap<CacheKey, CacheEntry>,
    total_bytes: AtomicU64,
    signatures: engine::SignatureTracker,
    pool: Arc<CompressionPool>,
    hits: AtomicU64,
    misses: AtomicU64,
    predictive_hits: AtomicU64,
    compressions: AtomicU64,
    decompressions: AtomicU64,
    evictions: AtomicU64,
    bytes_saved: AtomicU64,
}

impl CompressionCache {
    pub fn new(config: CompressionCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            signatures: engine::SignatureTracker::new(),
            pool: CompressionPool::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            predictive_hits: AtomicU64::new(0),
            compressions: AtomicU64::new(0),
            decompressions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            bytes_saved: AtomicU64::new(0),
        })
    }

    /// Compress `input`, serving from cache when the same content was
    /// compressed before.
    ///
    /// When `algorithm` is not given, one is selected from the inferred
    /// (or supplied) content hint and the input size.
    pub async fn compress(
        self: &Arc<Self>,
        input: &[u8],
        algorithm: Option<CompressionAlgorithm>,
        hint: Option<ContentHint>,
    ) -> CoreResult<Vec<u8>> {
        let hint = hint.unwrap_or_else(|| infer_content_hint(input));
        let algorithm = algorithm.unwrap_or_else(|| engine::select_algorithm(hint, input.len()));
        let level = engine::default_level(algorithm);
        let key = engine::cache_key(input, algorithm, level);

        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.last_access_ns = crate::now_unix_ns();
            entry.access_count += 1;
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.compressed.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // Predictive path: a frequent, similar signature may point at an
        // entry holding exactly this content under another key.
        let content_hash = engine::content_hash(input);
        if let Some(candidate_keys) = self.signatures.probe(input) {
            for candidate in candidate_keys {
                if let Some(mut entry) = self.entries.get_mut(&candidate) {
                    if entry.content_hash == content_hash {
                        entry.last_access_ns = crate::now_unix_ns();
                        entry.access_count += 1;
                        self.predictive_hits.fetch_add(1, Ordering::Relaxed);
                        debug!("predictive cache hit via pattern signature");
                        return Ok(entry.compressed.clone());
                    }
                }
            }
        }

        // Offload the actual codec work to the pool.
        let job = self
            .pool
            .submit_compress(input.to_vec(), algorithm, level, Priority::Normal)?;
        let compressed = job.await_result().await?;
        self.compressions.fetch_add(1, Ordering::Relaxed);

        // An uncacheable result does not fail the compression itself.
        match self.insert_entry(key, input, &compressed, algorithm, hint, content_hash) {
            Ok(()) => self.signatures.observe(input, key),
            Err(e) => debug!("compressed output not cached: {e}"),
        }
        Ok(compressed)
    }

    /// Decompress a buffer produced by [`CompressionCache::compress`].
    pub async fn decompress(self: &Arc<Self>, input: &[u8]) -> CoreResult<Vec<u8>> {
        let job = self
            .pool
            .submit_decompress(input.to_vec(), Priority::Normal)?;
        let output = job.await_result().await?;
        self.decompressions.fetch_add(1, Ordering::Relaxed);
        Ok(output)
    }

    /// Synchronous compression, bypassing the pool. Used by callers that
    /// are already on a blocking-friendly thread.
    pub fn compress_blocking(
        &self,
        input: &[u8],
        algorithm: CompressionAlgorithm,
    ) -> CoreResult<Vec<u8>> {
        engine::compress(input, algorithm, engine::default_level(algorithm))
    }

    /// Synchronous counterpart of [`CompressionCache::decompress`].
    pub fn decompress_blocking(&self, input: &[u8]) -> CoreResult<Vec<u8>> {
        engine::decompress(input)
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len() as u64,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            predictive_hits: self.predictive_hits.load(Ordering::Relaxed),
            compressions: self.compressions.load(Ordering::Relaxed),
            decompressions: self.decompressions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
        }
    }

    /// Periodic maintenance: evict per policy and refresh statistics.
    /// The supervisor calls this on its maintenance tick.
    pub fn run_maintenance(&self) {
        let max = self.config.max_bytes;
        let used = self.total_bytes.load(Ordering::Relaxed);
        if used > max {
            self.evict(used - max);
        } else {
            // TTL expiry applies even below capacity.
            let expired = eviction::expired_keys(&self.entries, self.config.ttl);
            for key in expired {
                self.remove_entry(&key);
            }
        }
    }

    /// Export live entries for persistence.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Seed the store from persisted entries, respecting capacity.
    pub fn restore(&self, entries: Vec<CacheEntry>) {
        for entry in entries {
            let size = entry.compressed.len() as u64;
            if self.total_bytes.load(Ordering::Relaxed) + size > self.config.max_bytes {
                break;
            }
            self.total_bytes.fetch_add(size, Ordering::Relaxed);
            self.entries.insert(entry.key, entry);
        }
    }

    fn insert_entry(
        &self,
        key: CacheKey,
        input: &[u8],
        compressed: &[u8],
        algorithm: CompressionAlgorithm,
        hint: ContentHint,
        content_hash: [u8; 32],
    ) -> CoreResult<()> {
        let size = compressed.len() as u64;
        if size > self.config.max_single_entry_bytes {
            return Err(CoreError::ResourceExhausted(format!(
                "entry of {size} bytes exceeds the {} byte single-entry cap",
                self.config.max_single_entry_bytes
            )));
        }
        let used = self.total_bytes.load(Ordering::Relaxed);
        if used + size > self.config.max_bytes {
            self.evict(used + size - self.config.max_bytes);
            if self.total_bytes.load(Ordering::Relaxed) + size > self.config.max_bytes {
                return Err(CoreError::ResourceExhausted(
                    "compression cache full and eviction could not free enough".into(),
                ));
            }
        }
        let now = crate::now_unix_ns();
        let original_size = input.len() as u64;
        if original_size > size {
            self.bytes_saved
                .fetch_add(original_size - size, Ordering::Relaxed);
        }
        self.entries.insert(
            key,
            CacheEntry {
                key,
                compressed: compressed.to_vec(),
                original_size,
                algorithm,
                ratio: size as f64 / original_size.max(1) as f64,
                content_hint: hint,
                content_hash,
                created_ns: now,
                last_access_ns: now,
                access_count: 1,
            },
        );
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    /// Evict per policy, freeing at least `shortfall` bytes and no less
    /// than a tenth of capacity.
    fn evict(&self, shortfall: u64) {
        let target = shortfall.max(self.config.max_bytes / 10);
        let victims =
            eviction::select_victims(self.config.policy, &self.entries, self.config.ttl, target);
        for key in victims {
            self.remove_entry(&key);
        }
    }

    fn remove_entry(&self, key: &CacheKey) {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.total_bytes
                .fetch_sub(entry.compressed.len() as u64, Ordering::Relaxed);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

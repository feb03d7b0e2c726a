//! Codec implementations, content inference, fingerprinting, and the
//! predictive signature population.
//!
//! Compressed output is a small self-describing container: one algorithm
//! tag byte, the original length (u64, big-endian), then the codec
//! payload. Decompression reads the tag, so `decompress(compress(x))`
//! holds for every algorithm with no side channel.

use std::io::{Read, Write};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::CacheKey;
use crate::error::{CoreError, CoreResult};

/// Closed set of supported algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    Deflate,
    Gzip,
    Brotli,
    Zstd,
    Lz4,
    Identity,
}

impl CompressionAlgorithm {
    fn tag(self) -> u8 {
        match self {
            CompressionAlgorithm::Deflate => 1,
            CompressionAlgorithm::Gzip => 2,
            CompressionAlgorithm::Brotli => 3,
            CompressionAlgorithm::Zstd => 4,
            CompressionAlgorithm::Lz4 => 5,
            CompressionAlgorithm::Identity => 0,
        }
    }

    fn from_tag(tag: u8) -> CoreResult<Self> {
        Ok(match tag {
            0 => CompressionAlgorithm::Identity,
            1 => CompressionAlgorithm::Deflate,
            2 => CompressionAlgorithm::Gzip,
            3 => CompressionAlgorithm::Brotli,
            4 => CompressionAlgorithm::Zstd,
            5 => CompressionAlgorithm::Lz4,
            other => {
                return Err(CoreError::Codec(format!(
                    "unknown compression container tag {other}"
                )))
            }
        })
    }
}

/// Inferred content class of an input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentHint {
    Text,
    Binary,
    /// Media and archives that will not compress further.
    AlreadyCompressed,
}

/// Default level per algorithm, folded into the cache key.
pub fn default_level(algorithm: CompressionAlgorithm) -> u32 {
    match algorithm {
        CompressionAlgorithm::Deflate | CompressionAlgorithm::Gzip => 6,
        CompressionAlgorithm::Brotli => 5,
        CompressionAlgorithm::Zstd => 3,
        CompressionAlgorithm::Lz4 | CompressionAlgorithm::Identity => 0,
    }
}

/// Inputs below this use the cheaper small-buffer codec of their class.
const SMALL_TEXT: usize = 4 * 1024;
const SMALL_BINARY: usize = 64 * 1024;

/// Map a content hint and size onto an algorithm.
pub fn select_algorithm(hint: ContentHint, len: usize) -> CompressionAlgorithm {
    match hint {
        ContentHint::Text => {
            if len < SMALL_TEXT {
                CompressionAlgorithm::Deflate
            } else {
                CompressionAlgorithm::Brotli
            }
        }
        ContentHint::Binary => {
            if len < SMALL_BINARY {
                CompressionAlgorithm::Lz4
            } else {
                CompressionAlgorithm::Zstd
            }
        }
        ContentHint::AlreadyCompressed => CompressionAlgorithm::Identity,
    }
}

/// Leading-byte signatures of formats that are already entropy-coded.
const MAGIC_NUMBERS: &[&[u8]] = &[
    &[0xFF, 0xD8, 0xFF],             // JPEG
    &[0x89, 0x50, 0x4E, 0x47],       // PNG
    b"GIF8",                          // GIF
    b"RIFF",                          // WEBP / WAV containers
    b"OggS",                          // Ogg
    b"ID3",                           // MP3
    &[0xFF, 0xFB],                    // MP3 frame sync
    &[0x1F, 0x8B],                    // gzip
    &[0x28, 0xB5, 0x2F, 0xFD],       // zstd
    b"PK\x03\x04",                    // zip
    b"Rar!",                          // rar
    b"7z\xBC\xAF",                    // 7-zip
    &[0x00, 0x00, 0x00, 0x18, 0x66], // mp4 ftyp (common size prefix)
];

/// Offset-4 signature for ISO media files of any box size.
const FTYP: &[u8] = b"ftyp";

/// Infer a content hint from the leading bytes.
///
/// Known media/archive magic numbers short-circuit to
/// [`ContentHint::AlreadyCompressed`]; otherwise a control-character
/// density heuristic over the first KiB separates text from binary.
pub fn infer_content_hint(input: &[u8]) -> ContentHint {
    if input.is_empty() {
        return ContentHint::Text;
    }
    for magic in MAGIC_NUMBERS {
        if input.starts_with(magic) {
            return ContentHint::AlreadyCompressed;
        }
    }
    if input.len() > 8 && &input[4..8] == FTYP {
        return ContentHint::AlreadyCompressed;
    }

    let sample = &input[..input.len().min(1024)];
    let control = sample
        .iter()
        .filter(|&&b| b < 0x09 || (b > 0x0D && b < 0x20) || b == 0x7F)
        .count();
    if (control as f64) / (sample.len() as f64) < 0.10 {
        ContentHint::Text
    } else {
        ContentHint::Binary
    }
}

/// Sample-based fingerprint key: first/middle/last 4 KiB, total length,
/// algorithm, and level.
pub fn cache_key(input: &[u8], algorithm: CompressionAlgorithm, level: u32) -> CacheKey {
    const SAMPLE: usize = 4 * 1024;
    let mut hasher = Sha256::new();
    hasher.update(&input[..input.len().min(SAMPLE)]);
    if input.len() > 2 * SAMPLE {
        let mid = input.len() / 2 - SAMPLE / 2;
        hasher.update(&input[mid..mid + SAMPLE]);
    }
    if input.len() > SAMPLE {
        hasher.update(&input[input.len() - SAMPLE.min(input.len())..]);
    }
    hasher.update((input.len() as u64).to_be_bytes());
    hasher.update([algorithm.tag()]);
    hasher.update(level.to_be_bytes());
    hasher.finalize().into()
}

/// Full-content hash used to verify predictive matches exactly.
pub fn content_hash(input: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hasher.finalize().into()
}

/// Compress `input` into the self-describing container.
pub fn compress(
    input: &[u8],
    algorithm: CompressionAlgorithm,
    level: u32,
) -> CoreResult<Vec<u8>> {
    let payload = match algorithm {
        CompressionAlgorithm::Identity => input.to_vec(),
        CompressionAlgorithm::Deflate => {
            let mut encoder = flate2::write::DeflateEncoder::new(
                Vec::new(),
                flate2::Compression::new(level),
            );
            encoder.write_all(input)?;
            encoder.finish()?
        }
        CompressionAlgorithm::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder.write_all(input)?;
            encoder.finish()?
        }
        CompressionAlgorithm::Brotli => {
            let mut out = Vec::new();
            {
                let mut writer = brotli::CompressorWriter::new(&mut out, 4096, level, 22);
                writer.write_all(input)?;
            }
            out
        }
        CompressionAlgorithm::Zstd => zstd::encode_all(input, level as i32)
            .map_err(|e| CoreError::Codec(format!("zstd encode: {e}")))?,
        CompressionAlgorithm::Lz4 => lz4_flex::compress_prepend_size(input),
    };

    let mut out = Vec::with_capacity(payload.len() + 9);
    out.push(algorithm.tag());
    out.extend_from_slice(&(input.len() as u64).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decompress a container produced by [`compress`].
pub fn decompress(input: &[u8]) -> CoreResult<Vec<u8>> {
    if input.len() < 9 {
        return Err(CoreError::Codec(
            "compressed container shorter than its header".into(),
        ));
    }
    let algorithm = CompressionAlgorithm::from_tag(input[0])?;
    let original_len = u64::from_be_bytes(input[1..9].try_into().unwrap_or_default()) as usize;
    let payload = &input[9..];

    let output = match algorithm {
        CompressionAlgorithm::Identity => payload.to_vec(),
        CompressionAlgorithm::Deflate => {
            let mut decoder = flate2::read::DeflateDecoder::new(payload);
            let mut out = Vec::with_capacity(original_len);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CoreError::Codec(format!("deflate decode: {e}")))?;
            out
        }
        CompressionAlgorithm::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(payload);
            let mut out = Vec::with_capacity(original_len);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CoreError::Codec(format!("gzip decode: {e}")))?;
            out
        }
        CompressionAlgorithm::Brotli => {
            let mut decoder = brotli::Decompressor::new(payload, 4096);
            let mut out = Vec::with_capacity(original_len);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CoreError::Codec(format!("brotli decode: {e}")))?;
            out
        }
        CompressionAlgorithm::Zstd => zstd::decode_all(payload)
            .map_err(|e| CoreError::Codec(format!("zstd decode: {e}")))?,
        CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| CoreError::Codec(format!("lz4 decode: {e}")))?,
    };

    if output.len() != original_len {
        return Err(CoreError::Codec(format!(
            "decompressed length {} disagrees with header {original_len}",
            output.len()
        )));
    }
    Ok(output)
}

/// Bytes in one pattern signature sample.
const SIGNATURE_LEN: usize = 64;
/// Population cap; lowest-frequency patterns are displaced.
const MAX_PATTERNS: usize = 128;
/// A pattern must recur this often before prediction trusts it.
const FREQUENCY_THRESHOLD: u32 = 3;
/// Required byte-level similarity between signatures.
const SIMILARITY_THRESHOLD: f64 = 0.7;
/// Keys remembered per pattern.
const KEYS_PER_PATTERN: usize = 8;

struct PatternRecord {
    sample: [u8; SIGNATURE_LEN],
    frequency: u32,
    keys: Vec<CacheKey>,
}

/// Small population of sampled byte-vector signatures with observation
/// frequency and the cache keys seen alongside each pattern.
pub struct SignatureTracker {
    patterns: Mutex<Vec<PatternRecord>>,
}

impl Default for SignatureTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureTracker {
    pub fn new() -> Self {
        Self {
            patterns: Mutex::new(Vec::new()),
        }
    }

    /// Candidate cache keys whose pattern matches `input` closely enough
    /// and frequently enough to be worth verifying.
    pub fn probe(&self, input: &[u8]) -> Option<Vec<CacheKey>> {
        let signature = sample_signature(input);
        let patterns = self.patterns.lock();
        patterns
            .iter()
            .filter(|p| p.frequency >= FREQUENCY_THRESHOLD)
            .map(|p| (similarity(&p.sample, &signature), p))
            .filter(|(score, _)| *score > SIMILARITY_THRESHOLD)
            .max_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, p)| p.keys.clone())
    }

    /// Record an observation of `input` stored under `key`.
    pub fn observe(&self, input: &[u8], key: CacheKey) {
        let signature = sample_signature(input);
        let mut patterns = self.patterns.lock();
        if let Some(record) = patterns
            .iter_mut()
            .find(|p| similarity(&p.sample, &signature) > SIMILARITY_THRESHOLD)
        {
            record.frequency += 1;
            if !record.keys.contains(&key) {
                if record.keys.len() >= KEYS_PER_PATTERN {
                    record.keys.remove(0);
                }
                record.keys.push(key);
            }
            return;
        }
        if patterns.len() >= MAX_PATTERNS {
            if let Some((index, _)) = patterns
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.frequency)
            {
                patterns.remove(index);
            }
        }
        patterns.push(PatternRecord {
            sample: signature,
            frequency: 1,
            keys: vec![key],
        });
    }
}

/// Evenly strided byte sample of the input.
fn sample_signature(input: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut sample = [0u8; SIGNATURE_LEN];
    if input.is_empty() {
        return sample;
    }
    let stride = (input.len() / SIGNATURE_LEN).max(1);
    for (i, slot) in sample.iter_mut().enumerate() {
        let index = (i * stride).min(input.len() - 1);
        *slot = input[index];
    }
    sample
}

fn similarity(a: &[u8; SIGNATURE_LEN], b: &[u8; SIGNATURE_LEN]) -> f64 {
    let matching = a.iter().zip(b.iter()).filter(|(x, y)| x == y).count();
    matching as f64 / SIGNATURE_LEN as f64
}

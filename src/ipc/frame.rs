//! Wire frame codec shared by every transport.
//!
//! Frame layout: `length (u32, big-endian, of everything after itself) |
//! version (u8, currently 1) | flags (u8) | payload`. Flag bit 0 marks a
//! deflate-compressed payload, bit 1 a keyed payload. The payload decodes
//! to a [`Message`] under the channel's configured serialization.
//!
//! The codec owns serialization and the optional transforms; transports
//! only move opaque frames. Decoding failures are protocol errors and
//! close the channel.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};
use crate::ipc::Message;

/// Protocol version emitted in every frame header.
pub const FRAME_VERSION: u8 = 1;

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const FLAG_KEYED: u8 = 0b0000_0010;

/// Message serializations the fabric supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerializationFormat {
    /// Compact binary via bincode. The default.
    Binary,
    /// Structured text via JSON, for debuggability at the cost of size.
    Json,
}

/// Per-channel frame encoder/decoder.
///
/// Holds the serialization choice, the compression threshold, and the
/// optional keystream material. Cheap to clone into reader and writer
/// tasks.
#[derive(Clone)]
pub struct FrameCodec {
    format: SerializationFormat,
    /// Payloads at or above this size are deflate-compressed. `usize::MAX`
    /// disables compression.
    compress_threshold: usize,
    key: Option<Vec<u8>>,
}

impl FrameCodec {
    pub fn new(
        format: SerializationFormat,
        compress_threshold: usize,
        key: Option<Vec<u8>>,
    ) -> Self {
        Self {
            format,
            compress_threshold,
            key,
        }
    }

    /// Serialize `message` into a complete wire frame.
    pub fn encode(&self, message: &Message) -> CoreResult<Bytes> {
        let mut payload = match self.format {
            SerializationFormat::Binary => bincode::serialize(message)
                .map_err(|e| CoreError::Codec(format!("bincode encode: {e}")))?,
            SerializationFormat::Json => serde_json::to_vec(message)
                .map_err(|e| CoreError::Codec(format!("json encode: {e}")))?,
        };

        let mut flags = 0u8;
        if payload.len() >= self.compress_threshold {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&payload)?;
            let compressed = encoder.finish()?;
            // Only keep the compressed form when it actually shrank.
            if compressed.len() < payload.len() {
                payload = compressed;
                flags |= FLAG_COMPRESSED;
            }
        }
        if let Some(key) = &self.key {
            apply_keystream(key, &mut payload);
            flags |= FLAG_KEYED;
        }

        let body_len = payload.len() + 2;
        let mut frame = BytesMut::with_capacity(4 + body_len);
        frame.put_u32(body_len as u32);
        frame.put_u8(FRAME_VERSION);
        frame.put_u8(flags);
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    /// Decode a complete wire frame back into a [`Message`].
    pub fn decode(&self, frame: &[u8]) -> CoreResult<Message> {
        if frame.len() < 6 {
            return Err(CoreError::Protocol(format!(
                "frame of {} bytes is shorter than the header",
                frame.len()
            )));
        }
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if declared != frame.len() - 4 {
            return Err(CoreError::Protocol(format!(
                "frame length field {declared} disagrees with body of {}",
                frame.len() - 4
            )));
        }
        let version = frame[4];
        if version != FRAME_VERSION {
            return Err(CoreError::Protocol(format!(
                "unsupported frame version {version}"
            )));
        }
        let flags = frame[5];
        let mut payload = frame[6..].to_vec();

        if flags & FLAG_KEYED != 0 {
            let key = self
                .key
                .as_ref()
                .ok_or_else(|| CoreError::Protocol("keyed frame on an unkeyed channel".into()))?;
            apply_keystream(key, &mut payload);
        }
        if flags & FLAG_COMPRESSED != 0 {
            let mut decoder = DeflateDecoder::new(payload.as_slice());
            let mut plain = Vec::new();
            decoder
                .read_to_end(&mut plain)
                .map_err(|e| CoreError::Protocol(format!("frame inflate failed: {e}")))?;
            payload = plain;
        }

        match self.format {
            SerializationFormat::Binary => bincode::deserialize(&payload)
                .map_err(|e| CoreError::Protocol(format!("bincode decode: {e}"))),
            SerializationFormat::Json => serde_json::from_slice(&payload)
                .map_err(|e| CoreError::Protocol(format!("json decode: {e}"))),
        }
    }
}

/// Symmetric keystream transform derived from the channel key.
///
/// SHA-256 in counter mode over the key material. This obfuscates frames
/// on otherwise-plaintext transports; authenticated encryption of the
/// underlying link is the embedding host's responsibility.
fn apply_keystream(key: &[u8], data: &mut [u8]) {
    let mut counter: u64 = 0;
    let mut offset = 0;
    while offset < data.len() {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(counter.to_be_bytes());
        let block = hasher.finalize();
        for byte in block.iter() {
            if offset >= data.len() {
                break;
            }
            data[offset] ^= byte;
            offset += 1;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{MessageKind, Priority};

    fn sample_message(payload: Vec<u8>) -> Message {
        let mut message = Message::new(MessageKind::Request, payload);
        message.origin = "renderer-1".into();
        message.destination = "network".into();
        message.priority = Priority::High;
        message
            .metadata
            .insert("content-type".into(), "text/html".into());
        message
    }

    #[test]
    fn binary_round_trip() {
        let codec = FrameCodec::new(SerializationFormat::Binary, usize::MAX, None);
        let message = sample_message(vec![7; 128]);
        let frame = codec.encode(&message).unwrap();
        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded.id, message.id);
        assert_eq!(decoded.payload, message.payload);
        assert_eq!(decoded.metadata, message.metadata);
    }

    #[test]
    fn json_round_trip() {
        let codec = FrameCodec::new(SerializationFormat::Json, usize::MAX, None);
        let message = sample_message(b"hello".to_vec());
        let decoded = codec.decode(&codec.encode(&message).unwrap()).unwrap();
        assert_eq!(decoded.payload, b"hello");
        assert_eq!(decoded.kind, MessageKind::Request);
    }

    #[test]
    fn large_payloads_compress_on_the_wire() {
        let codec = FrameCodec::new(SerializationFormat::Binary, 256, None);
        // Highly repetitive payload compresses well.
        let message = sample_message(vec![b'a'; 16 * 1024]);
        let frame = codec.encode(&message).unwrap();
        assert!(frame.len() < 16 * 1024);
        assert_eq!(frame[5] & FLAG_COMPRESSED, FLAG_COMPRESSED);
        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded.payload, message.payload);
    }

    #[test]
    fn keyed_frames_round_trip_and_differ_on_the_wire() {
        let key = b"channel secret".to_vec();
        let keyed = FrameCodec::new(SerializationFormat::Binary, usize::MAX, Some(key));
        let plain = FrameCodec::new(SerializationFormat::Binary, usize::MAX, None);
        let message = sample_message(vec![1, 2, 3, 4]);

        let keyed_frame = keyed.encode(&message).unwrap();
        let plain_frame = plain.encode(&message).unwrap();
        assert_ne!(keyed_frame[6..], plain_frame[6..]);

        let decoded = keyed.decode(&keyed_frame).unwrap();
        assert_eq!(decoded.payload, message.payload);

        // An unkeyed channel must refuse keyed frames outright.
        assert!(plain.decode(&keyed_frame).is_err());
    }

    #[test]
    fn corrupt_length_field_is_a_protocol_error() {
        let codec = FrameCodec::new(SerializationFormat::Binary, usize::MAX, None);
        let mut frame = codec.encode(&sample_message(vec![5; 32])).unwrap().to_vec();
        frame[0] ^= 0x40;
        assert!(matches!(
            codec.decode(&frame),
            Err(CoreError::Protocol(_))
        ));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let codec = FrameCodec::new(SerializationFormat::Binary, usize::MAX, None);
        let mut frame = codec.encode(&sample_message(vec![])).unwrap().to_vec();
        frame[4] = 9;
        assert!(codec.decode(&frame).is_err());
    }
}

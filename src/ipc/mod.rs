//! # IPC Fabric Abstraction and Transport Module
//!
//! This module provides the typed, correlated, prioritized message-passing
//! layer that connects the engine's logical processes (main, renderer,
//! network, GPU, storage, utility). It defines the core message schema,
//! channel model, and the pluggable transport abstraction used by the
//! fabric.
//!
//! ## Key Design Principles
//!
//! - **Unified Interface**: every transport implements the same thin verb
//!   set (connect, accept, read-frame, write-frame, disconnect)
//! - **Message Abstraction**: one message schema across all transports
//! - **Async-First**: built on Tokio for non-blocking I/O
//! - **Correlation**: request/response pairing by message id
//! - **Backpressure**: bounded outbound queues that fail fast when full
//!
//! ## Transport Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │    Subsystem    │───▶│     Channel      │───▶│    Specific     │
//! │   (supervisor,  │    │  (queue, routes, │    │ Implementation  │
//! │  net, renderer) │    │   correlation)   │    │ (UDS/TCP/ring)  │
//! └─────────────────┘    └──────────────────┘    └─────────────────┘
//! ```
//!
//! ## Supported Transport Mechanisms
//!
//! - **Unix Domain Sockets**: local sockets with full duplex framing
//! - **TCP Sockets**: network-capable channels with low-latency options
//! - **In-Process Ring**: bounded ring pairs for same-process endpoints
//!
//! ## Wire Protocol
//!
//! Every frame on every transport is `length (4 bytes, big-endian) |
//! version (1 byte) | flags (1 byte) | payload`; the payload decodes to
//! the [`Message`] structure under the channel's configured serialization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

pub mod fabric;
pub mod frame;
pub mod memory;
pub mod tcp;
pub mod unix_socket;

pub use fabric::{ChannelHandle, IpcFabric};
pub use frame::{FrameCodec, SerializationFormat};

/// Stable identifier for a channel in the supervisor-owned registry.
///
/// Handlers capture channel ids rather than channel references and resolve
/// them through the registry, which breaks the ownership cycle between
/// channels and the handlers bound to them.
pub type ChannelId = u64;

/// Correlation key linking a response to its originating request.
pub type CorrelationId = u64;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Message kinds carried by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Expects a correlated [`MessageKind::Response`].
    Request,
    /// Reply carrying the correlation id of a prior request.
    Response,
    /// One-way routed message; no response expected.
    Notification,
    /// Broadcast-style event.
    Event,
    /// Channel establishment exchange.
    Handshake,
    /// One chunk of a larger streamed payload.
    StreamChunk,
    /// Transport-level error report.
    Error,
}

/// Delivery priority. Outbound queues drain Critical first, Low last;
/// within one class delivery is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Queue index, highest priority first.
    pub(crate) fn lane(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

/// The unified message structure exchanged over every channel.
///
/// Messages are created by senders, owned by the outbound queue until
/// delivered, and freed after handler completion or TTL expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Monotonically assigned identifier, unique within the sending process.
    pub id: u64,
    /// Originating channel identifier.
    pub origin: String,
    /// Destination channel identifier.
    pub destination: String,
    pub kind: MessageKind,
    pub priority: Priority,
    /// Wall-clock creation instant, nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    /// Time-to-live in milliseconds; expired messages are dropped on
    /// dequeue rather than delivered stale.
    pub ttl_ms: u64,
    /// Present on responses; names the request being answered. A response
    /// whose correlation id is unknown to the receiver is dropped with a
    /// logged warning.
    pub correlation_id: Option<CorrelationId>,
    /// Dispatch route for notifications and events.
    pub route: Option<String>,
    /// Free-form string metadata.
    pub metadata: HashMap<String, String>,
    /// Serialized payload bytes; the schema is an application concern.
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message with an automatically assigned monotonic id.
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            origin: String::new(),
            destination: String::new(),
            kind,
            priority: Priority::Normal,
            timestamp_ns: crate::now_unix_ns(),
            ttl_ms: 30_000,
            correlation_id: None,
            route: None,
            metadata: HashMap::new(),
            payload,
        }
    }

    /// Builder-style route assignment.
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    /// Builder-style priority assignment.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Construct the response to this message, carrying its id as the
    /// correlation id and swapping origin and destination.
    pub fn response(&self, payload: Vec<u8>) -> Self {
        let mut reply = Message::new(MessageKind::Response, payload);
        reply.correlation_id = Some(self.id);
        reply.origin = self.destination.clone();
        reply.destination = self.origin.clone();
        reply.priority = self.priority;
        reply.route = self.route.clone();
        reply
    }

    /// Whether the TTL has elapsed since creation.
    pub fn is_expired(&self) -> bool {
        let age_ms = crate::now_unix_ns().saturating_sub(self.timestamp_ns) / 1_000_000;
        age_ms > self.ttl_ms
    }

    /// Approximate in-memory size, used for queue accounting.
    pub fn size(&self) -> usize {
        self.payload.len()
            + self.origin.len()
            + self.destination.len()
            + self.route.as_ref().map_or(0, |r| r.len())
            + self
                .metadata
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
            + 64
    }
}

/// Transport mechanisms the factory can construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Unix domain socket.
    LocalSocket,
    /// TCP socket, usable across machines.
    Tcp,
    /// In-process bounded ring pair; the same-process analog of a
    /// shared-memory ring.
    Memory,
}

/// Channel direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Read,
    Write,
    Duplex,
}

/// Channel I/O mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMode {
    Blocking,
    NonBlocking,
}

/// Connection lifecycle of a channel.
///
/// Transitions are linear except Error, which may be entered from any
/// state and is terminal until the channel is reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Initializing,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

impl ChannelState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        if next == Error {
            return true;
        }
        matches!(
            (self, next),
            (Initializing, Connecting)
                | (Connecting, Connected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
                | (Error, Connecting)
                | (Disconnected, Connecting)
        )
    }
}

/// Where a transport connects or listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host for TCP, filesystem path for UDS, ring name for Memory.
    pub address: String,
    /// Port for TCP; ignored by the other transports.
    pub port: u16,
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            address: host.into(),
            port,
        }
    }

    pub fn path(path: impl Into<String>) -> Self {
        Self {
            address: path.into(),
            port: 0,
        }
    }
}

/// Automatic reconnect policy for a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    /// Delay before the first attempt; doubles per attempt.
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
        }
    }
}

/// Everything needed to open a channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel identifier used as the message origin/destination name.
    pub name: String,
    pub transport: TransportKind,
    pub endpoint: Endpoint,
    pub direction: Direction,
    pub mode: ChannelMode,
    pub serialization: SerializationFormat,
    /// Whether this side listens (accepts one peer) or connects.
    pub listen: bool,
    /// Keying material enabling frame obfuscation; real AEAD is supplied
    /// by the embedding host.
    pub key_material: Option<Vec<u8>>,
    /// Outbound queue bound; falls back to the fabric default when `None`.
    pub queue_size: Option<usize>,
    pub reconnect: Option<ReconnectPolicy>,
}

impl ChannelConfig {
    /// A duplex non-blocking channel with binary serialization.
    pub fn new(name: impl Into<String>, transport: TransportKind, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            transport,
            endpoint,
            direction: Direction::Duplex,
            mode: ChannelMode::NonBlocking,
            serialization: SerializationFormat::Binary,
            listen: false,
            key_material: None,
            queue_size: None,
            reconnect: None,
        }
    }

    pub fn listening(mut self) -> Self {
        self.listen = true;
        self
    }
}

/// Reading half of an established transport link.
#[async_trait]
pub trait FrameRead: Send {
    /// Read one whole frame, header included.
    async fn read_frame(&mut self) -> CoreResult<Bytes>;
}

/// Writing half of an established transport link.
#[async_trait]
pub trait FrameWrite: Send {
    /// Write one whole frame and flush it.
    async fn write_frame(&mut self, frame: Bytes) -> CoreResult<()>;

    /// Flush and close the link.
    async fn shutdown(&mut self) -> CoreResult<()>;
}

/// An established link, split so the dispatch loop can read while the
/// flush loop writes.
pub struct FramedPair {
    pub reader: Box<dyn FrameRead>,
    pub writer: Box<dyn FrameWrite>,
}

/// Generic transport interface.
///
/// Implementations own connection establishment only; framing above the
/// raw link is handled by [`frame::FrameCodec`], and message semantics by
/// the fabric. The verb set is deliberately thin so new mechanisms slot
/// in without touching the fabric.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport mechanism implemented by this instance.
    fn kind(&self) -> TransportKind;

    /// Connect to a listening peer.
    async fn connect(&mut self, endpoint: &Endpoint) -> CoreResult<FramedPair>;

    /// Bind and accept exactly one peer.
    ///
    /// The fabric opens one channel per peer; multi-peer fan-in is the
    /// supervisor's concern, not the transport's.
    async fn accept(&mut self, endpoint: &Endpoint) -> CoreResult<FramedPair>;

    /// Largest frame this transport will carry.
    fn max_frame_size(&self) -> usize {
        16 * 1024 * 1024
    }
}

/// Transport factory constructing instances from a [`TransportKind`].
pub struct TransportFactory;

impl TransportFactory {
    /// Instantiate the transport for `kind`.
    pub fn create(kind: TransportKind) -> Box<dyn Transport> {
        match kind {
            TransportKind::LocalSocket => Box::new(unix_socket::UnixSocketTransport::new()),
            TransportKind::Tcp => Box::new(tcp::TcpTransport::new()),
            TransportKind::Memory => Box::new(memory::MemoryTransport::new()),
        }
    }
}

/// Validation applied before a frame payload is decoded.
pub(crate) fn check_frame_len(len: usize, max: usize) -> CoreResult<()> {
    if len > max {
        return Err(CoreError::Protocol(format!(
            "frame of {len} bytes exceeds the {max} byte limit"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_monotonic() {
        let a = Message::new(MessageKind::Notification, vec![]);
        let b = Message::new(MessageKind::Notification, vec![]);
        assert!(b.id > a.id);
    }

    #[test]
    fn response_carries_correlation_and_swaps_endpoints() {
        let mut request = Message::new(MessageKind::Request, vec![1, 2, 3]);
        request.origin = "renderer-1".into();
        request.destination = "network".into();

        let reply = request.response(vec![9]);
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(reply.correlation_id, Some(request.id));
        assert_eq!(reply.origin, "network");
        assert_eq!(reply.destination, "renderer-1");
    }

    #[test]
    fn state_machine_is_linear_except_error() {
        use ChannelState::*;
        assert!(Initializing.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnecting));
        assert!(Disconnecting.can_transition_to(Disconnected));
        assert!(!Initializing.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Disconnected));
        // Error is reachable from everywhere.
        for state in [Initializing, Connecting, Connected, Disconnecting, Disconnected] {
            assert!(state.can_transition_to(Error));
        }
    }

    #[test]
    fn fresh_message_is_not_expired() {
        let mut message = Message::new(MessageKind::Event, vec![]);
        assert!(!message.is_expired());
        message.ttl_ms = 0;
        message.timestamp_ns = 1;
        assert!(message.is_expired());
    }

    #[test]
    fn priority_lanes_order_critical_first() {
        assert!(Priority::Critical.lane() < Priority::High.lane());
        assert!(Priority::High.lane() < Priority::Normal.lane());
        assert!(Priority::Normal.lane() < Priority::Low.lane());
    }
}

//! # HTTP/3 + QUIC Client
//!
//! Multiplexed request/response over QUIC with session resumption, 0-RTT
//! early data, per-stream and per-connection flow control, pluggable
//! congestion control, and multipath scheduling.
//!
//! The client is a protocol engine: the UDP datagram layer and the TLS
//! handshake cryptography live with the embedding host behind the
//! [`OriginEndpoint`] trait. Everything above that seam (connection
//! pooling, ticket storage, early-data policy, stream id issuance, flow
//! credit, congestion notifications, path scheduling) is implemented and
//! driven here, which keeps the whole state machine testable without a
//! network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult, NetworkErrorKind};
use crate::net::congestion::{self, CongestionController};
use crate::net::dns::{DnsResolver, RecordType};
use crate::net::multipath::{MultipathMode, NetworkPath, PathScheduler};
use crate::net::optimizer::{Http3Settings, NetworkOptimizer};
use crate::net::{Headers, Method};

/// QUIC transport parameters exchanged during the handshake.
///
/// Field names and value ranges follow the QUIC transport specification;
/// these are the wire identifiers the embedding host encodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportParameters {
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub max_idle_timeout: Duration,
    pub max_udp_payload_size: u16,
    pub ack_delay_exponent: u8,
    pub max_ack_delay: Duration,
    pub active_connection_id_limit: u32,
    pub disable_active_migration: bool,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            initial_max_data: 1024 * 1024,
            initial_max_stream_data_bidi_local: 256 * 1024,
            initial_max_stream_data_bidi_remote: 256 * 1024,
            initial_max_stream_data_uni: 128 * 1024,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 3,
            max_idle_timeout: Duration::from_secs(30),
            max_udp_payload_size: 1452,
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(25),
            active_connection_id_limit: 4,
            disable_active_migration: false,
        }
    }
}

/// Opaque resumption token issued by an origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTicket {
    pub host: String,
    pub port: u16,
    pub ticket: Vec<u8>,
    pub alpn: String,
    pub issued_ns: u64,
}

/// Per-(host, port) session ticket store.
#[derive(Default)]
pub struct TicketStore {
    tickets: DashMap<(String, u16), SessionTicket>,
}

impl TicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, ticket: SessionTicket) {
        self.tickets
            .insert((ticket.host.clone(), ticket.port), ticket);
    }

    pub fn get(&self, host: &str, port: u16) -> Option<SessionTicket> {
        self.tickets
            .get(&(host.to_string(), port))
            .map(|t| t.clone())
    }

    pub fn snapshot(&self) -> Vec<SessionTicket> {
        self.tickets.iter().map(|t| t.clone()).collect()
    }

    pub fn restore(&self, tickets: Vec<SessionTicket>) {
        for ticket in tickets {
            self.put(ticket);
        }
    }
}

/// Handshake outcome reported by the origin seam.
#[derive(Debug, Clone)]
pub struct HandshakeResult {
    /// Application protocol agreed via ALPN.
    pub alpn: String,
    pub peer_params: TransportParameters,
    /// Resumption ticket for the next connection, when the origin issued
    /// one.
    pub ticket: Option<Vec<u8>>,
    /// Whether early data sent with a resumption ticket was accepted.
    pub early_data_accepted: bool,
}

/// One request/response exchange handed to the origin seam.
#[derive(Debug, Clone)]
pub struct OriginExchange {
    pub host: String,
    pub port: u16,
    pub stream_id: u64,
    pub method: Method,
    pub path: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// True when this exchange rode in 0-RTT early data.
    pub early_data: bool,
}

/// Response produced by the origin seam.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub trailers: Option<Headers>,
}

/// The seam between this protocol engine and the host's datagram + TLS
/// layers.
#[async_trait]
pub trait OriginEndpoint: Send + Sync {
    /// Run a QUIC handshake (full, or resumed when `resumption` is
    /// given) with ALPN negotiation.
    async fn handshake(
        &self,
        host: &str,
        port: u16,
        resumption: Option<&SessionTicket>,
    ) -> CoreResult<HandshakeResult>;

    /// Serve one exchange on an established connection.
    async fn exchange(&self, exchange: OriginExchange) -> CoreResult<OriginResponse>;
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Established,
    Draining,
    Closed,
}

/// Stream lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    Closed,
    Reset,
}

#[derive(Debug)]
struct StreamEntry {
    state: StreamState,
    bytes_sent: u64,
    bytes_received: u64,
}

/// Async flow-control window shared between producers and the consumer
/// that replenishes it.
struct FlowController {
    limit: AtomicU64,
    used: AtomicU64,
    replenished: Notify,
}

impl FlowController {
    fn new(limit: u64) -> Arc<Self> {
        Arc::new(Self {
            limit: AtomicU64::new(limit),
            used: AtomicU64::new(0),
            replenished: Notify::new(),
        })
    }

    /// Suspend until `bytes` of credit are available, then take them.
    async fn reserve(&self, bytes: u64, deadline: Duration) -> CoreResult<()> {
        let wait = async {
            loop {
                // Register for the wakeup before checking, so a release
                // landing between the check and the await is not lost.
                let notified = self.replenished.notified();
                loop {
                    let used = self.used.load(Ordering::Acquire);
                    let limit = self.limit.load(Ordering::Acquire);
                    if used + bytes > limit {
                        break;
                    }
                    if self
                        .used
                        .compare_exchange(used, used + bytes, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                notified.await;
            }
        };
        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| CoreError::Timeout(deadline))
    }

    /// Return credit as the application consumes bytes.
    fn release(&self, bytes: u64) {
        self.used.fetch_sub(
            bytes.min(self.used.load(Ordering::Acquire)),
            Ordering::AcqRel,
        );
        self.replenished.notify_waiters();
    }
}

/// Live RTT/bandwidth/loss estimates for one connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetrics {
    pub smoothed_rtt: Duration,
    pub bandwidth_bytes_per_sec: u64,
    pub loss_rate: f64,
    pub exchanges: u64,
}

/// One pooled HTTP/3 connection.
pub struct Connection {
    pub host: String,
    pub port: u16,
    pub alpn: String,
    state: ConnectionState,
    local_params: TransportParameters,
    peer_params: TransportParameters,
    streams: HashMap<u64, StreamEntry>,
    /// Client-initiated bidirectional ids: 0, 4, 8, …
    next_bidi_stream: u64,
    /// Client-initiated unidirectional ids: 2, 6, 10, …
    next_uni_stream: u64,
    send_flow: Arc<FlowController>,
    congestion: Box<dyn CongestionController>,
    scheduler: PathScheduler,
    ticket: Option<SessionTicket>,
    /// 0-RTT was attempted and the origin accepted it.
    early_data_accepted: bool,
    metrics: ConnectionMetrics,
    last_activity_ns: u64,
    settings: Http3Settings,
}

impl Connection {
    /// Issue the next client-initiated bidirectional stream id.
    ///
    /// Ids are monotonic per direction; reuse would be a protocol
    /// violation.
    fn open_bidi_stream(&mut self) -> CoreResult<u64> {
        let open = self
            .streams
            .values()
            .filter(|s| s.state == StreamState::Open)
            .count() as u64;
        if open >= self.peer_params.initial_max_streams_bidi {
            return Err(CoreError::ResourceExhausted(format!(
                "peer stream limit {} reached",
                self.peer_params.initial_max_streams_bidi
            )));
        }
        let id = self.next_bidi_stream;
        self.next_bidi_stream += 4;
        self.streams.insert(
            id,
            StreamEntry {
                state: StreamState::Open,
                bytes_sent: 0,
                bytes_received: 0,
            },
        );
        Ok(id)
    }

    /// Issue the next client-initiated unidirectional stream id.
    fn open_uni_stream(&mut self) -> u64 {
        let id = self.next_uni_stream;
        self.next_uni_stream += 4;
        id
    }

    /// Resumption ticket bound to this connection, if the origin issued
    /// one.
    pub fn session_ticket(&self) -> Option<&SessionTicket> {
        self.ticket.as_ref()
    }

    fn finish_stream(&mut self, id: u64, sent: u64, received: u64) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.bytes_sent = sent;
            stream.bytes_received = received;
            stream.state = StreamState::Closed;
        }
    }

    fn record_exchange(&mut self, bytes: u64, rtt: Duration) {
        self.congestion.on_ack(bytes, rtt);
        self.scheduler.on_acked(0, bytes);
        self.metrics.exchanges += 1;
        self.metrics.smoothed_rtt = if self.metrics.smoothed_rtt.is_zero() {
            rtt
        } else {
            (self.metrics.smoothed_rtt * 7 + rtt) / 8
        };
        let rate = (bytes as f64 / rtt.as_secs_f64().max(1e-6)) as u64;
        if rate > self.metrics.bandwidth_bytes_per_sec {
            self.metrics.bandwidth_bytes_per_sec = rate;
        }
        self.last_activity_ns = crate::now_unix_ns();
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn metrics(&self) -> ConnectionMetrics {
        self.metrics.clone()
    }

    pub fn multipath_mode(&self) -> MultipathMode {
        self.scheduler.mode()
    }

    fn is_idle_past(&self, timeout: Duration) -> bool {
        let idle_ns = crate::now_unix_ns().saturating_sub(self.last_activity_ns);
        idle_ns > timeout.as_nanos() as u64
    }
}

/// A streamed response: headers up front, body as consumable chunks.
///
/// Consuming chunks replenishes receive-window credit, which is what
/// keeps a fast origin from overrunning a slow consumer.
pub struct ResponseStream {
    pub status: u16,
    pub headers: Headers,
    pub trailers: Option<Headers>,
    /// True when served from 0-RTT early data.
    pub early_data: bool,
    chunks: mpsc::Receiver<Bytes>,
    recv_flow: Arc<FlowController>,
}

impl ResponseStream {
    /// Next body chunk, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.recv().await?;
        self.recv_flow.release(chunk.len() as u64);
        Some(chunk)
    }

    /// Drain the whole body.
    pub async fn collect_body(mut self) -> Vec<u8> {
        let mut body = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            body.extend_from_slice(&chunk);
        }
        body
    }
}

/// Data chunk size used when streaming response bodies to the consumer.
const BODY_CHUNK: usize = 16 * 1024;

/// Typed connect failures surfaced by the client.
fn classify_connect_error(err: CoreError) -> CoreError {
    match err {
        e @ CoreError::Network { .. } => e,
        CoreError::Timeout(d) => CoreError::transient(
            NetworkErrorKind::TimedOut,
            format!("connect timed out after {d:?}"),
        ),
        other => CoreError::network_fatal(NetworkErrorKind::HandshakeFailed, other.to_string()),
    }
}

/// The HTTP/3 client and its connection pool.
pub struct Http3Client {
    resolver: Arc<DnsResolver>,
    optimizer: Arc<NetworkOptimizer>,
    origin: Arc<dyn OriginEndpoint>,
    pool: DashMap<(String, u16), Arc<Mutex<Connection>>>,
    pub tickets: TicketStore,
    /// Global 0-RTT disable for replay hardening.
    zero_rtt_enabled: bool,
    next_path_id: AtomicU64,
}

impl Http3Client {
    pub fn new(
        resolver: Arc<DnsResolver>,
        optimizer: Arc<NetworkOptimizer>,
        origin: Arc<dyn OriginEndpoint>,
        zero_rtt_enabled: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            optimizer,
            origin,
            pool: DashMap::new(),
            tickets: TicketStore::new(),
            zero_rtt_enabled,
            next_path_id: AtomicU64::new(1),
        })
    }

    /// Resolve `host` and return an established connection, reusing a
    /// pooled one when present.
    pub async fn resolve_and_connect(
        self: &Arc<Self>,
        host: &str,
        port: u16,
    ) -> CoreResult<Arc<Mutex<Connection>>> {
        if let Some(existing) = self.pooled(host, port).await {
            return Ok(existing);
        }
        self.resolver.resolve(host, RecordType::A).await?;
        self.establish(host, port, None).await
    }

    /// Resume with a session ticket, attempting 0-RTT when policy allows.
    ///
    /// Returns the connection and whether early data was accepted. When
    /// 0-RTT is disabled globally the handshake downgrades to 1-RTT and
    /// the flag is false.
    pub async fn connect_0rtt(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        ticket: SessionTicket,
    ) -> CoreResult<(Arc<Mutex<Connection>>, bool)> {
        // An established connection beats any resumption: 0-RTT only
        // applies to new handshakes.
        if let Some(existing) = self.pooled(host, port).await {
            return Ok((existing, false));
        }
        self.resolver.resolve(host, RecordType::A).await?;
        let resumption = self.zero_rtt_enabled.then_some(ticket);
        let connection = self.establish(host, port, resumption).await?;
        let accepted = connection.lock().await.early_data_accepted;
        Ok((connection, accepted))
    }

    /// Issue a request on `connection`, returning the streamed response.
    ///
    /// The request opens a bidirectional stream, reserves send-window
    /// credit for the body (suspending until credit is available), and
    /// notifies the congestion controller of the exchange. A request
    /// that was riding in rejected early data is transparently replayed
    /// over 1-RTT.
    pub async fn request(
        self: &Arc<Self>,
        connection: &Arc<Mutex<Connection>>,
        method: Method,
        path: &str,
        headers: Headers,
        body: Vec<u8>,
    ) -> CoreResult<ResponseStream> {
        let (host, port, stream_id, early, send_flow, deadline, pacing_delay) = {
            let mut conn = connection.lock().await;
            if conn.state != ConnectionState::Established {
                return Err(CoreError::ChannelClosed(format!(
                    "connection to {}:{} is {:?}",
                    conn.host, conn.port, conn.state
                )));
            }
            let stream_id = conn.open_bidi_stream()?;
            // Early data only ever carries idempotent methods.
            let early = conn.early_data_accepted && method.is_idempotent();
            let deadline = conn.local_params.max_idle_timeout;

            // Congestion window gates how much we put in flight; pace the
            // send when the profile asks for it.
            let window = conn.congestion.window();
            let body_len = body.len() as u64;
            let pacing_delay = if conn.settings.pacing_enabled && body_len > 0 {
                conn.congestion.pacing_rate().map(|rate| {
                    let gained = rate as f64 * conn.settings.pacing_gain;
                    Duration::from_secs_f64(body_len as f64 / gained.max(1.0))
                })
            } else {
                None
            };
            if body_len > window {
                debug!(
                    stream = stream_id,
                    "body of {body_len} bytes exceeds cwnd {window}; sender will pace"
                );
            }
            (
                conn.host.clone(),
                conn.port,
                stream_id,
                early,
                conn.send_flow.clone(),
                deadline,
                pacing_delay,
            )
        };

        // Per-connection flow control: suspend until the body fits in the
        // send window. Credit returns when the response is consumed.
        let body_len = body.len() as u64;
        if body_len > 0 {
            send_flow.reserve(body_len, deadline).await?;
        }
        if let Some(delay) = pacing_delay {
            tokio::time::sleep(delay.min(Duration::from_millis(50))).await;
        }

        let started = std::time::Instant::now();
        let exchange = OriginExchange {
            host: host.clone(),
            port,
            stream_id,
            method,
            path: path.to_string(),
            headers,
            body,
            early_data: early,
        };
        let outcome = self.origin.exchange(exchange).await;
        let rtt = started.elapsed();

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                if body_len > 0 {
                    send_flow.release(body_len);
                }
                let mut conn = connection.lock().await;
                conn.congestion.on_loss(body_len.max(1200));
                conn.metrics.loss_rate = (conn.metrics.loss_rate * 0.9) + 0.1;
                return Err(match err {
                    CoreError::Network { kind, detail, .. } => {
                        // A lost connection resurfaces in-flight requests
                        // as retryable only when replay is safe.
                        conn.state = ConnectionState::Draining;
                        CoreError::Network {
                            kind,
                            detail,
                            retryable: method.is_idempotent(),
                        }
                    }
                    other => other,
                });
            }
        };

        let response_len = response.body.len() as u64;
        {
            let mut conn = connection.lock().await;
            conn.metrics.loss_rate *= 0.9;
            conn.record_exchange(body_len + response_len, rtt);
            conn.finish_stream(stream_id, body_len, response_len);
            if body_len > 0 {
                conn.send_flow.release(body_len);
            }
        }

        // Stream the body out in data-frame-sized chunks against the
        // receive window.
        let recv_flow = FlowController::new(
            self.optimizer
                .get_active_http3_settings()
                .transport
                .initial_max_stream_data_bidi_local
                .max(BODY_CHUNK as u64),
        );
        let (tx, rx) = mpsc::channel(8);
        let feeder_flow = recv_flow.clone();
        let body = response.body;
        tokio::spawn(async move {
            let mut offset = 0usize;
            while offset < body.len() {
                let end = (offset + BODY_CHUNK).min(body.len());
                let chunk = Bytes::copy_from_slice(&body[offset..end]);
                if feeder_flow
                    .reserve(chunk.len() as u64, Duration::from_secs(60))
                    .await
                    .is_err()
                {
                    warn!("response consumer stalled past the receive-window deadline");
                    return;
                }
                if tx.send(chunk).await.is_err() {
                    return;
                }
                offset = end;
            }
        });

        Ok(ResponseStream {
            status: response.status,
            headers: response.headers,
            trailers: response.trailers,
            early_data: early,
            chunks: rx,
            recv_flow,
        })
    }

    /// Close a connection with an application code and reason.
    pub async fn close(&self, connection: &Arc<Mutex<Connection>>, code: u64, reason: &str) {
        let mut conn = connection.lock().await;
        info!(
            host = %conn.host,
            port = conn.port,
            code,
            reason,
            "closing http3 connection"
        );
        conn.state = ConnectionState::Closed;
        self.pool.remove(&(conn.host.clone(), conn.port));
    }

    /// Drop pooled connections idle past their negotiated timeout.
    pub async fn sweep_idle(&self) {
        let keys: Vec<(String, u16)> = self.pool.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some(entry) = self.pool.get(&key) else {
                continue;
            };
            let connection = entry.value().clone();
            drop(entry);
            let mut conn = connection.lock().await;
            if conn.state == ConnectionState::Established
                && conn.is_idle_past(conn.local_params.max_idle_timeout)
            {
                debug!(host = %conn.host, port = conn.port, "idle timeout, closing connection");
                conn.state = ConnectionState::Closed;
                self.pool.remove(&key);
            }
        }
    }

    async fn pooled(&self, host: &str, port: u16) -> Option<Arc<Mutex<Connection>>> {
        let entry = self.pool.get(&(host.to_string(), port))?;
        let connection = entry.value().clone();
        drop(entry);
        let state = connection.lock().await.state;
        (state == ConnectionState::Established).then_some(connection)
    }

    /// Run the handshake and install the connection in the pool.
    ///
    /// The pool slot is inserted in Handshaking state under its mutex
    /// before the handshake runs, so a second caller for the same
    /// endpoint awaits the same connection instead of racing a second
    /// handshake.
    async fn establish(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        resumption: Option<SessionTicket>,
    ) -> CoreResult<Arc<Mutex<Connection>>> {
        let settings = self.optimizer.get_active_http3_settings();
        let mut scheduler = PathScheduler::new(settings.multipath);
        let path_id = self.next_path_id.fetch_add(1, Ordering::Relaxed) as u32;
        let mut primary = NetworkPath::new(0, format!("path-{path_id}"));
        primary.cwnd = settings.transport.initial_max_data;
        scheduler.add_path(primary);
        // Path validation precedes use.
        scheduler.mark_validated(0);

        let connection = Arc::new(Mutex::new(Connection {
            host: host.to_string(),
            port,
            alpn: String::new(),
            state: ConnectionState::Handshaking,
            local_params: settings.transport.clone(),
            peer_params: TransportParameters::default(),
            streams: HashMap::new(),
            next_bidi_stream: 0,
            next_uni_stream: 2,
            send_flow: FlowController::new(settings.transport.initial_max_data),
            congestion: congestion::build(settings.congestion),
            scheduler,
            ticket: resumption.clone(),
            early_data_accepted: false,
            metrics: ConnectionMetrics::default(),
            last_activity_ns: crate::now_unix_ns(),
            settings: settings.clone(),
        }));

        // At most one handshake in progress per endpoint: the slot goes
        // into the pool locked, and stays locked until the handshake
        // resolves.
        let mut conn = connection.lock().await;
        self.pool
            .insert((host.to_string(), port), connection.clone());

        let result = self
            .origin
            .handshake(host, port, resumption.as_ref())
            .await
            .map_err(classify_connect_error);
        let handshake = match result {
            Ok(handshake) => handshake,
            Err(err) => {
                conn.state = ConnectionState::Closed;
                drop(conn);
                self.pool.remove(&(host.to_string(), port));
                return Err(err);
            }
        };

        conn.alpn = handshake.alpn;
        conn.peer_params = handshake.peer_params;
        conn.send_flow = FlowController::new(conn.peer_params.initial_max_data);
        conn.early_data_accepted = resumption.is_some() && handshake.early_data_accepted;
        conn.state = ConnectionState::Established;
        conn.last_activity_ns = crate::now_unix_ns();
        // h3 control stream plus the QPACK encoder/decoder pair.
        let _control = conn.open_uni_stream();
        let _qpack_encoder = conn.open_uni_stream();
        let _qpack_decoder = conn.open_uni_stream();
        if let Some(ticket_bytes) = handshake.ticket {
            let ticket = SessionTicket {
                host: host.to_string(),
                port,
                ticket: ticket_bytes,
                alpn: conn.alpn.clone(),
                issued_ns: crate::now_unix_ns(),
            };
            conn.ticket = Some(ticket.clone());
            self.tickets.put(ticket);
        }
        if resumption.is_some() && !conn.early_data_accepted {
            debug!(
                host,
                port, "origin rejected early data; requests replay over 1-RTT"
            );
        }
        info!(host, port, alpn = %conn.alpn, "http3 connection established");
        drop(conn);
        Ok(connection)
    }
}

/// A canned origin serving scripted responses, for tests and for
/// embedding-host bring-up before a real datagram layer exists.
pub struct ScriptedOrigin {
    responses: DashMap<String, OriginResponse>,
    pub accept_early_data: std::sync::atomic::AtomicBool,
    pub handshakes: AtomicU64,
    pub exchanges: AtomicU64,
    pub early_exchanges: AtomicU64,
    pub fail_next_exchange: std::sync::atomic::AtomicBool,
    /// Every served exchange, for assertions on what reached the wire.
    pub exchange_log: parking_lot::Mutex<Vec<OriginExchange>>,
}

impl Default for ScriptedOrigin {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedOrigin {
    pub fn new() -> Self {
        Self {
            responses: DashMap::new(),
            accept_early_data: std::sync::atomic::AtomicBool::new(true),
            handshakes: AtomicU64::new(0),
            exchanges: AtomicU64::new(0),
            early_exchanges: AtomicU64::new(0),
            fail_next_exchange: std::sync::atomic::AtomicBool::new(false),
            exchange_log: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn serve(&self, path: &str, status: u16, headers: Headers, body: Vec<u8>) {
        self.responses.insert(
            path.to_string(),
            OriginResponse {
                status,
                headers,
                body,
                trailers: None,
            },
        );
    }
}

#[async_trait]
impl OriginEndpoint for ScriptedOrigin {
    async fn handshake(
        &self,
        _host: &str,
        _port: u16,
        resumption: Option<&SessionTicket>,
    ) -> CoreResult<HandshakeResult> {
        self.handshakes.fetch_add(1, Ordering::Relaxed);
        Ok(HandshakeResult {
            alpn: "h3".to_string(),
            peer_params: TransportParameters::default(),
            ticket: Some(format!("ticket-{}", crate::now_unix_ns()).into_bytes()),
            early_data_accepted: resumption.is_some()
                && self.accept_early_data.load(Ordering::Relaxed),
        })
    }

    async fn exchange(&self, exchange: OriginExchange) -> CoreResult<OriginResponse> {
        if self.fail_next_exchange.swap(false, Ordering::Relaxed) {
            return Err(CoreError::transient(
                NetworkErrorKind::ConnectionReset,
                "connection lost mid-exchange",
            ));
        }
        self.exchanges.fetch_add(1, Ordering::Relaxed);
        if exchange.early_data {
            self.early_exchanges.fetch_add(1, Ordering::Relaxed);
        }
        self.exchange_log.lock().push(exchange.clone());
        self.responses
            .get(&exchange.path)
            .map(|r| r.clone())
            .ok_or_else(|| {
                CoreError::network_fatal(
                    NetworkErrorKind::Unreachable,
                    format!("no scripted response for {}", exchange.path),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsConfig;
    use crate::net::dns::{DnsRecord, DnsUpstream, UpstreamKind};

    struct FixedUpstream;

    #[async_trait]
    impl DnsUpstream for FixedUpstream {
        fn kind(&self) -> UpstreamKind {
            UpstreamKind::DoH
        }

        fn descriptor(&self) -> &str {
            "fixed"
        }

        async fn query(&self, hostname: &str, record_type: RecordType) -> CoreResult<Vec<DnsRecord>> {
            Ok(vec![DnsRecord {
                hostname: hostname.to_string(),
                record_type,
                value: "203.0.113.7".to_string(),
                ttl: Duration::from_secs(300),
                observed_ns: crate::now_unix_ns(),
            }])
        }
    }

    fn make_client(origin: Arc<ScriptedOrigin>, zero_rtt: bool) -> Arc<Http3Client> {
        let resolver = DnsResolver::new(DnsConfig::default(), vec![Arc::new(FixedUpstream)]);
        let optimizer = Arc::new(NetworkOptimizer::new());
        Http3Client::new(resolver, optimizer, origin, zero_rtt)
    }

    #[tokio::test]
    async fn get_request_round_trip() {
        let origin = Arc::new(ScriptedOrigin::new());
        origin.serve("/a", 200, vec![("content-type".into(), "text/html".into())], b"<html>".to_vec());
        let client = make_client(origin.clone(), true);

        let connection = client.resolve_and_connect("example.test", 443).await.unwrap();
        let response = client
            .request(&connection, Method::Get, "/a", Vec::new(), Vec::new())
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.collect_body().await, b"<html>");
        assert_eq!(origin.handshakes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn pool_reuses_established_connections() {
        let origin = Arc::new(ScriptedOrigin::new());
        origin.serve("/", 204, Vec::new(), Vec::new());
        let client = make_client(origin.clone(), true);

        let first = client.resolve_and_connect("example.test", 443).await.unwrap();
        let second = client.resolve_and_connect("example.test", 443).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(origin.handshakes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn stream_ids_are_monotonic_per_direction() {
        let origin = Arc::new(ScriptedOrigin::new());
        origin.serve("/s", 200, Vec::new(), Vec::new());
        let client = make_client(origin, true);
        let connection = client.resolve_and_connect("example.test", 443).await.unwrap();

        for _ in 0..3 {
            client
                .request(&connection, Method::Get, "/s", Vec::new(), Vec::new())
                .await
                .unwrap();
        }
        let conn = connection.lock().await;
        let mut ids: Vec<u64> = conn.streams.keys().copied().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 4, 8]);
    }

    #[tokio::test]
    async fn zero_rtt_accepted_carries_idempotent_requests_early() {
        let origin = Arc::new(ScriptedOrigin::new());
        origin.serve("/fast", 200, Vec::new(), b"ok".to_vec());
        let client = make_client(origin.clone(), true);

        // First connection yields the resumption ticket.
        let first = client.resolve_and_connect("example.test", 443).await.unwrap();
        client.close(&first, 0, "done").await;
        let ticket = client.tickets.get("example.test", 443).unwrap();

        let (connection, accepted) = client
            .connect_0rtt("example.test", 443, ticket)
            .await
            .unwrap();
        assert!(accepted);

        let response = client
            .request(&connection, Method::Get, "/fast", Vec::new(), Vec::new())
            .await
            .unwrap();
        assert!(response.early_data);
        assert_eq!(origin.early_exchanges.load(Ordering::Relaxed), 1);

        // Non-idempotent requests never ride early data.
        let response = client
            .request(&connection, Method::Post, "/fast", Vec::new(), b"body".to_vec())
            .await
            .unwrap();
        assert!(!response.early_data);
        assert_eq!(origin.early_exchanges.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn rejected_early_data_replays_transparently_over_1rtt() {
        let origin = Arc::new(ScriptedOrigin::new());
        origin.serve("/page", 200, Vec::new(), b"content".to_vec());
        origin.accept_early_data.store(false, Ordering::Relaxed);
        let client = make_client(origin.clone(), true);

        let first = client.resolve_and_connect("example.test", 443).await.unwrap();
        client.close(&first, 0, "done").await;
        let ticket = client.tickets.get("example.test", 443).unwrap();

        let (connection, accepted) = client
            .connect_0rtt("example.test", 443, ticket)
            .await
            .unwrap();
        assert!(!accepted);

        // The request still succeeds, identically to the 1-RTT path.
        let response = client
            .request(&connection, Method::Get, "/page", Vec::new(), Vec::new())
            .await
            .unwrap();
        assert!(!response.early_data);
        assert_eq!(response.collect_body().await, b"content");
        assert_eq!(origin.early_exchanges.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn zero_rtt_can_be_disabled_globally() {
        let origin = Arc::new(ScriptedOrigin::new());
        origin.serve("/", 200, Vec::new(), Vec::new());
        let client = make_client(origin.clone(), false);

        let first = client.resolve_and_connect("example.test", 443).await.unwrap();
        client.close(&first, 0, "done").await;
        let ticket = client.tickets.get("example.test", 443).unwrap();

        let (_, accepted) = client
            .connect_0rtt("example.test", 443, ticket)
            .await
            .unwrap();
        assert!(!accepted);
        assert_eq!(origin.early_exchanges.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn lost_connection_is_retryable_only_for_idempotent_methods() {
        let origin = Arc::new(ScriptedOrigin::new());
        origin.serve("/x", 200, Vec::new(), Vec::new());
        let client = make_client(origin.clone(), true);

        let connection = client.resolve_and_connect("example.test", 443).await.unwrap();
        origin.fail_next_exchange.store(true, Ordering::Relaxed);
        let err = client
            .request(&connection, Method::Get, "/x", Vec::new(), Vec::new())
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable());

        let connection = client.resolve_and_connect("example.test", 443).await.unwrap();
        origin.fail_next_exchange.store(true, Ordering::Relaxed);
        let err = client
            .request(&connection, Method::Post, "/x", Vec::new(), b"data".to_vec())
            .await
            .err()
            .unwrap();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn body_chunks_replenish_the_receive_window() {
        let origin = Arc::new(ScriptedOrigin::new());
        // A body much larger than one chunk.
        origin.serve("/big", 200, Vec::new(), vec![0xAB; 300 * 1024]);
        let client = make_client(origin, true);
        let connection = client.resolve_and_connect("example.test", 443).await.unwrap();

        let mut response = client
            .request(&connection, Method::Get, "/big", Vec::new(), Vec::new())
            .await
            .unwrap();
        let mut total = 0usize;
        while let Some(chunk) = response.next_chunk().await {
            total += chunk.len();
        }
        assert_eq!(total, 300 * 1024);
    }
}

//! # IPC Fabric
//!
//! The fabric owns channels end to end: it establishes transports through
//! the factory, frames and serializes messages, correlates responses to
//! pending requests, dispatches inbound traffic to route handlers, drains
//! bounded outbound queues in priority order, emits heartbeats, and drives
//! reconnect with bounded exponential backoff.
//!
//! ## Dispatch Order
//!
//! For every inbound message, in order:
//!
//! 1. a response whose correlation id matches a pending slot completes
//!    exactly that slot;
//! 2. a message whose route has a channel-level handler invokes it
//!    concurrently with receive-loop progress;
//! 3. otherwise the fabric-global handler for the message kind runs;
//! 4. otherwise the message is logged and discarded.
//!
//! ## Queueing
//!
//! Each channel's outbound queue is bounded; a full queue fails the send
//! with a resource-exhaustion error rather than blocking the sender. The
//! flush loop drains critical > high > normal > low, FIFO within a class,
//! and drops messages whose TTL expired while queued.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::IpcConfig;
use crate::error::{CoreError, CoreResult};
use crate::ipc::{
    ChannelConfig, ChannelId, ChannelState, CorrelationId, FrameCodec, FramedPair, Message,
    MessageKind, Priority, TransportFactory,
};

/// Route used by the liveness notifications every connected channel
/// exchanges.
pub const HEARTBEAT_ROUTE: &str = "system.heartbeat";

/// Boxed future returned by message handlers. `Some(reply)` is sent back
/// on the originating channel.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Option<Message>> + Send>>;

/// A registered message handler.
pub type Handler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Callback invoked with every channel-level failure.
pub type ErrorCallback = Arc<dyn Fn(ChannelId, &CoreError) + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Message>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Point-in-time view of one channel, for supervision and diagnostics.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub id: ChannelId,
    pub name: String,
    pub state: ChannelState,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
}

/// Bounded four-lane priority queue.
struct OutboundQueue {
    lanes: [VecDeque<Message>; 4],
    len: usize,
    capacity: usize,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            lanes: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
            len: 0,
            capacity,
        }
    }

    fn push(&mut self, message: Message) -> CoreResult<()> {
        if self.len >= self.capacity {
            return Err(CoreError::ResourceExhausted(format!(
                "outbound queue at capacity ({})",
                self.capacity
            )));
        }
        self.lanes[message.priority.lane()].push_back(message);
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<Message> {
        for lane in &mut self.lanes {
            if let Some(message) = lane.pop_front() {
                self.len -= 1;
                return Some(message);
            }
        }
        None
    }
}

struct ChannelStats {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    /// Unix nanos of the most recent inbound heartbeat (or connect).
    last_liveness_ns: AtomicU64,
}

/// One live channel. Owned by the fabric's registry; everything else
/// refers to it by id.
struct Channel {
    id: ChannelId,
    config: ChannelConfig,
    codec: FrameCodec,
    state_tx: watch::Sender<ChannelState>,
    pending: DashMap<CorrelationId, oneshot::Sender<Message>>,
    handlers: DashMap<String, Handler>,
    outbound: Mutex<OutboundQueue>,
    outbound_ready: Notify,
    shutdown_tx: watch::Sender<bool>,
    stats: ChannelStats,
    error_callback: Mutex<Option<ErrorCallback>>,
}

impl Channel {
    fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Apply a transition, refusing ones the lifecycle does not allow.
    fn set_state(&self, next: ChannelState) {
        let current = self.state();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(
                channel = self.id,
                "refusing channel state transition {current:?} -> {next:?}"
            );
            return;
        }
        debug!(channel = self.id, "channel state {current:?} -> {next:?}");
        self.state_tx.send_replace(next);
    }

    fn enqueue(&self, message: Message) -> CoreResult<()> {
        if self.state() != ChannelState::Connected {
            return Err(CoreError::ChannelClosed(format!(
                "channel {} is {:?}, not connected",
                self.config.name,
                self.state()
            )));
        }
        self.outbound.lock().push(message)?;
        self.outbound_ready.notify_one();
        Ok(())
    }

    /// Drop every pending await; their callers observe a closed channel.
    fn fail_pending(&self) {
        let keys: Vec<CorrelationId> = self.pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            self.pending.remove(&key);
        }
    }

    fn report_error(&self, err: &CoreError) {
        if let Some(cb) = self.error_callback.lock().as_ref() {
            cb(self.id, err);
        }
    }

    fn enter_error(&self, err: &CoreError) {
        error!(channel = self.id, name = %self.config.name, "channel error: {err}");
        self.state_tx.send_replace(ChannelState::Error);
        self.fail_pending();
        self.report_error(err);
    }

    fn mark_live(&self) {
        self.stats
            .last_liveness_ns
            .store(crate::now_unix_ns(), Ordering::Relaxed);
    }
}

/// Why the pump loops stopped.
enum PumpExit {
    Shutdown,
    Failed(CoreError),
}

/// The typed, correlated, prioritized message-passing fabric.
pub struct IpcFabric {
    config: IpcConfig,
    channels: Arc<DashMap<ChannelId, Arc<Channel>>>,
    global_handlers: Arc<DashMap<MessageKind, Handler>>,
    next_channel_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IpcFabric {
    pub fn new(config: IpcConfig) -> Arc<Self> {
        let fabric = Arc::new(Self {
            config,
            channels: Arc::new(DashMap::new()),
            global_handlers: Arc::new(DashMap::new()),
            next_channel_id: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
        });
        fabric.clone().start_heartbeats();
        fabric
    }

    /// Open a channel and start its connection lifecycle.
    ///
    /// Returns immediately; use [`IpcFabric::wait_connected`] to block on
    /// establishment. Listening channels stay in Connecting until a peer
    /// arrives.
    pub fn open(self: &Arc<Self>, config: ChannelConfig) -> ChannelId {
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let codec = FrameCodec::new(
            config.serialization,
            self.config.compress_threshold,
            config.key_material.clone(),
        );
        let queue_size = config.queue_size.unwrap_or(self.config.queue_size);
        let (state_tx, _) = watch::channel(ChannelState::Initializing);
        let (shutdown_tx, _) = watch::channel(false);
        let channel = Arc::new(Channel {
            id,
            config,
            codec,
            state_tx,
            pending: DashMap::new(),
            handlers: DashMap::new(),
            outbound: Mutex::new(OutboundQueue::new(queue_size)),
            outbound_ready: Notify::new(),
            shutdown_tx,
            stats: ChannelStats {
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                last_liveness_ns: AtomicU64::new(crate::now_unix_ns()),
            },
            error_callback: Mutex::new(None),
        });
        self.channels.insert(id, channel.clone());

        let fabric = self.clone();
        let task = tokio::spawn(async move {
            fabric.run_channel(channel).await;
        });
        self.tasks.lock().push(task);
        id
    }

    /// Block until the channel reaches Connected, or fail when it errors
    /// out or the deadline passes.
    pub async fn wait_connected(&self, id: ChannelId, deadline: Duration) -> CoreResult<()> {
        let channel = self.channel(id)?;
        let mut rx = channel.state_tx.subscribe();
        let wait = async {
            loop {
                match *rx.borrow() {
                    ChannelState::Connected => return Ok(()),
                    ChannelState::Error | ChannelState::Disconnected => {
                        return Err(CoreError::ChannelClosed(format!(
                            "channel {} failed before connecting",
                            channel.config.name
                        )));
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(CoreError::ChannelClosed("channel dropped".into()));
                }
            }
        };
        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| CoreError::Timeout(deadline))?
    }

    /// Queue a message for delivery on `id`.
    ///
    /// Fails fast with a resource-exhaustion error when the bounded
    /// outbound queue is full, and with a channel-closed error when the
    /// channel is not connected.
    pub fn send(&self, id: ChannelId, mut message: Message) -> CoreResult<()> {
        let channel = self.channel(id)?;
        if message.origin.is_empty() {
            message.origin = channel.config.name.clone();
        }
        channel.enqueue(message)
    }

    /// Send a request and suspend until its correlated response arrives.
    ///
    /// The pending slot is armed before the send so a fast responder
    /// cannot race the registration, and removed on timeout so a late
    /// response is dropped with a warning instead of completing a dead
    /// await.
    pub async fn send_and_await(
        &self,
        id: ChannelId,
        mut request: Message,
        timeout: Option<Duration>,
    ) -> CoreResult<Message> {
        let channel = self.channel(id)?;
        request.kind = MessageKind::Request;
        if request.origin.is_empty() {
            request.origin = channel.config.name.clone();
        }
        let deadline = timeout.unwrap_or(self.config.default_timeout);
        let correlation = request.id;

        let (slot_tx, slot_rx) = oneshot::channel();
        channel.pending.insert(correlation, slot_tx);
        if let Err(e) = channel.enqueue(request) {
            channel.pending.remove(&correlation);
            return Err(e);
        }

        match tokio::time::timeout(deadline, slot_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CoreError::ChannelClosed(format!(
                "channel {} closed while awaiting response",
                channel.config.name
            ))),
            Err(_) => {
                channel.pending.remove(&correlation);
                let err = CoreError::Timeout(deadline);
                channel.report_error(&err);
                Err(err)
            }
        }
    }

    /// Send a routed one-way notification.
    pub fn notify(&self, id: ChannelId, route: &str, payload: Vec<u8>) -> CoreResult<()> {
        self.send(
            id,
            Message::new(MessageKind::Notification, payload).with_route(route),
        )
    }

    /// Bind a handler to a route on one channel.
    pub fn register_handler(&self, id: ChannelId, route: &str, handler: Handler) -> CoreResult<()> {
        let channel = self.channel(id)?;
        channel.handlers.insert(route.to_string(), handler);
        Ok(())
    }

    /// Bind the fabric-global fallback handler for a message kind.
    pub fn register_kind_handler(&self, kind: MessageKind, handler: Handler) {
        self.global_handlers.insert(kind, handler);
    }

    /// Install the per-channel error callback.
    pub fn set_error_callback(&self, id: ChannelId, callback: ErrorCallback) -> CoreResult<()> {
        let channel = self.channel(id)?;
        *channel.error_callback.lock() = Some(callback);
        Ok(())
    }

    /// Close a channel, draining nothing further, and remove it from the
    /// registry.
    pub async fn close(&self, id: ChannelId) -> CoreResult<()> {
        let channel = self.channel(id)?;
        channel.shutdown_tx.send_replace(true);
        let mut rx = channel.state_tx.subscribe();
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if matches!(
                    *rx.borrow(),
                    ChannelState::Disconnected | ChannelState::Error
                ) {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        self.channels.remove(&id);
        Ok(())
    }

    /// Close every channel. Used by orderly shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<ChannelId> = self.channels.iter().map(|e| *e.key()).collect();
        for id in ids {
            let _ = self.close(id).await;
        }
    }

    /// Snapshot one channel for supervision.
    pub fn status(&self, id: ChannelId) -> CoreResult<ChannelHandle> {
        let channel = self.channel(id)?;
        Ok(ChannelHandle {
            id,
            name: channel.config.name.clone(),
            state: channel.state(),
            messages_sent: channel.stats.sent.load(Ordering::Relaxed),
            messages_received: channel.stats.received.load(Ordering::Relaxed),
            messages_dropped: channel.stats.dropped.load(Ordering::Relaxed),
        })
    }

    fn channel(&self, id: ChannelId) -> CoreResult<Arc<Channel>> {
        self.channels
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| CoreError::ChannelClosed(format!("no channel with id {id}")))
    }

    /// Connection lifecycle: establish, pump, and reconnect with bounded
    /// exponential backoff when configured.
    async fn run_channel(self: Arc<Self>, channel: Arc<Channel>) {
        let mut attempt: u32 = 0;
        loop {
            channel.set_state(ChannelState::Connecting);
            let mut transport = TransportFactory::create(channel.config.transport);
            let established = if channel.config.listen {
                transport.accept(&channel.config.endpoint).await
            } else {
                transport.connect(&channel.config.endpoint).await
            };

            let pair = match established {
                Ok(pair) => pair,
                Err(err) => {
                    if self.should_retry(&channel, &err, &mut attempt).await {
                        continue;
                    }
                    channel.enter_error(&err);
                    return;
                }
            };

            channel.set_state(ChannelState::Connected);
            channel.mark_live();
            attempt = 0;
            info!(
                channel = channel.id,
                name = %channel.config.name,
                transport = ?channel.config.transport,
                "channel connected"
            );

            match self.pump(channel.clone(), pair).await {
                PumpExit::Shutdown => {
                    channel.set_state(ChannelState::Disconnecting);
                    channel.fail_pending();
                    channel.set_state(ChannelState::Disconnected);
                    return;
                }
                PumpExit::Failed(err) => {
                    channel.enter_error(&err);
                    if self.should_retry(&channel, &err, &mut attempt).await {
                        continue;
                    }
                    return;
                }
            }
        }
    }

    async fn should_retry(&self, channel: &Channel, err: &CoreError, attempt: &mut u32) -> bool {
        let Some(policy) = channel.config.reconnect.clone() else {
            return false;
        };
        if !err.is_retryable() && !matches!(err, CoreError::ChannelClosed(_)) {
            return false;
        }
        if *attempt >= policy.max_attempts {
            warn!(
                channel = channel.id,
                "reconnect attempts exhausted after {} tries", policy.max_attempts
            );
            return false;
        }
        let backoff = policy
            .initial_backoff_ms
            .saturating_mul(1u64 << (*attempt).min(16))
            .min(policy.max_backoff_ms);
        *attempt += 1;
        debug!(
            channel = channel.id,
            "reconnect attempt {} in {backoff} ms", *attempt
        );
        tokio::time::sleep(Duration::from_millis(backoff)).await;
        !*channel.shutdown_tx.borrow()
    }

    /// Run the flush and dispatch loops until one fails or shutdown is
    /// requested.
    async fn pump(&self, channel: Arc<Channel>, pair: FramedPair) -> PumpExit {
        let FramedPair {
            mut reader,
            mut writer,
        } = pair;

        let flush_channel = channel.clone();
        let mut flush_shutdown = channel.shutdown_tx.subscribe();
        let flush: JoinHandle<CoreResult<()>> = tokio::spawn(async move {
            loop {
                // Drain the queue fully before waiting again.
                loop {
                    let next = flush_channel.outbound.lock().pop();
                    let Some(message) = next else { break };
                    if message.is_expired() {
                        flush_channel.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(channel = flush_channel.id, id = message.id, "dropping expired message");
                        continue;
                    }
                    let frame = flush_channel.codec.encode(&message)?;
                    if let Err(e) = writer.write_frame(frame).await {
                        warn!(channel = flush_channel.id, "outbound write failed: {e}");
                        return Err(e);
                    }
                    flush_channel.stats.sent.fetch_add(1, Ordering::Relaxed);
                }
                tokio::select! {
                    _ = flush_channel.outbound_ready.notified() => {}
                    _ = flush_shutdown.changed() => {
                        let _ = writer.shutdown().await;
                        return Ok(());
                    }
                }
            }
        });

        let mut dispatch_shutdown = channel.shutdown_tx.subscribe();
        let exit = loop {
            tokio::select! {
                _ = dispatch_shutdown.changed() => break PumpExit::Shutdown,
                frame = reader.read_frame() => {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(err) => break PumpExit::Failed(err),
                    };
                    match channel.codec.decode(&frame) {
                        Ok(message) => self.dispatch(&channel, message),
                        Err(err) => {
                            // Malformed frame: protocol error closes the channel.
                            break PumpExit::Failed(err);
                        }
                    }
                }
            }
        };

        flush.abort();
        let _ = flush.await;
        exit
    }

    /// Route one inbound message. Handlers run concurrently with the
    /// receive loop.
    fn dispatch(&self, channel: &Arc<Channel>, message: Message) {
        channel.stats.received.fetch_add(1, Ordering::Relaxed);

        if message.route.as_deref() == Some(HEARTBEAT_ROUTE) {
            channel.mark_live();
            return;
        }

        if message.kind == MessageKind::Response {
            let Some(correlation) = message.correlation_id else {
                warn!(
                    channel = channel.id,
                    id = message.id,
                    "dropping response without correlation id"
                );
                return;
            };
            match channel.pending.remove(&correlation) {
                Some((_, slot)) => {
                    // A dead receiver means the await already timed out.
                    if slot.send(message).is_err() {
                        debug!(channel = channel.id, correlation, "response arrived after await gave up");
                    }
                }
                None => {
                    warn!(
                        channel = channel.id,
                        correlation, "dropping response with unknown correlation id"
                    );
                }
            }
            return;
        }

        let handler = message
            .route
            .as_ref()
            .and_then(|route| channel.handlers.get(route).map(|h| h.clone()))
            .or_else(|| self.global_handlers.get(&message.kind).map(|h| h.clone()));

        match handler {
            Some(handler) => {
                let worker_channel = channel.clone();
                let worker = tokio::spawn(async move {
                    if let Some(reply) = handler(message).await {
                        if let Err(e) = worker_channel.enqueue(reply) {
                            warn!(channel = worker_channel.id, "failed to queue handler reply: {e}");
                        }
                    }
                });
                let report_channel = channel.clone();
                tokio::spawn(async move {
                    if let Err(join_err) = worker.await {
                        if join_err.is_panic() {
                            let err = CoreError::Invariant("message handler panicked".into());
                            report_channel.report_error(&err);
                        }
                    }
                });
            }
            None => {
                debug!(
                    channel = channel.id,
                    route = message.route.as_deref().unwrap_or("<none>"),
                    kind = ?message.kind,
                    "no handler for message; discarding"
                );
            }
        }
    }

    /// Emit heartbeats on every connected channel and error out channels
    /// whose peer missed two consecutive windows.
    fn start_heartbeats(self: Arc<Self>) {
        let interval = self.config.heartbeat_interval;
        let fabric = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let window_ns = 2 * interval.as_nanos() as u64;
                let now = crate::now_unix_ns();
                let channels: Vec<Arc<Channel>> =
                    fabric.channels.iter().map(|e| e.value().clone()).collect();
                for channel in channels {
                    if channel.state() != ChannelState::Connected {
                        continue;
                    }
                    let last = channel.stats.last_liveness_ns.load(Ordering::Relaxed);
                    if now.saturating_sub(last) > window_ns {
                        let err = CoreError::ChannelClosed(format!(
                            "peer on {} missed two heartbeat windows",
                            channel.config.name
                        ));
                        channel.enter_error(&err);
                        continue;
                    }
                    let beat = Message::new(MessageKind::Notification, Vec::new())
                        .with_route(HEARTBEAT_ROUTE)
                        .with_priority(Priority::Critical);
                    if let Err(e) = channel.enqueue(beat) {
                        debug!(channel = channel.id, "heartbeat not queued: {e}");
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }
}

impl Drop for IpcFabric {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Endpoint, TransportKind};

    fn fast_config() -> IpcConfig {
        IpcConfig {
            heartbeat_interval: Duration::from_millis(200),
            default_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn ring_pair(fabric: &Arc<IpcFabric>, name: &str) -> (ChannelId, ChannelId) {
        let server = fabric.open(
            ChannelConfig::new("server", TransportKind::Memory, Endpoint::path(name)).listening(),
        );
        let client = fabric.open(ChannelConfig::new(
            "client",
            TransportKind::Memory,
            Endpoint::path(name),
        ));
        (server, client)
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let fabric = IpcFabric::new(fast_config());
        let (server, client) = ring_pair(&fabric, "fabric-rr");
        fabric
            .wait_connected(client, Duration::from_secs(1))
            .await
            .unwrap();
        fabric
            .wait_connected(server, Duration::from_secs(1))
            .await
            .unwrap();

        fabric
            .register_handler(
                server,
                "echo",
                handler_fn(|message| async move { Some(message.response(message.payload.clone())) }),
            )
            .unwrap();

        let request = Message::new(MessageKind::Request, b"hello".to_vec()).with_route("echo");
        let response = fabric
            .send_and_await(client, request, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(response.payload, b"hello");
        assert_eq!(response.kind, MessageKind::Response);
    }

    #[tokio::test]
    async fn await_times_out_and_late_response_is_dropped() {
        let fabric = IpcFabric::new(fast_config());
        let (server, client) = ring_pair(&fabric, "fabric-timeout");
        fabric
            .wait_connected(client, Duration::from_secs(1))
            .await
            .unwrap();

        // Peer sleeps well past the caller's deadline before replying.
        fabric
            .register_handler(
                server,
                "slow",
                handler_fn(|message| async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Some(message.response(vec![]))
                }),
            )
            .unwrap();

        let started = std::time::Instant::now();
        let request = Message::new(MessageKind::Request, vec![]).with_route("slow");
        let err = fabric
            .send_and_await(client, request, Some(Duration::from_millis(100)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_millis(400));

        // The late response must not complete anything; give it time to
        // arrive and be discarded.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let status = fabric.status(client).unwrap();
        assert_eq!(status.state, ChannelState::Connected);
    }

    #[tokio::test]
    async fn queue_full_fails_fast() {
        let mut config = fast_config();
        config.queue_size = 2;
        let fabric = IpcFabric::new(config);
        // No peer ever connects, so nothing drains the queue.
        let id = fabric.open(
            ChannelConfig::new("stuck", TransportKind::Memory, Endpoint::path("fabric-full"))
                .listening(),
        );
        // The listening channel is still Connecting; force-fill by waiting
        // for a real connected channel instead.
        let client = fabric.open(ChannelConfig::new(
            "writer",
            TransportKind::Memory,
            Endpoint::path("fabric-full"),
        ));
        fabric
            .wait_connected(client, Duration::from_secs(1))
            .await
            .unwrap();
        let _ = id;

        // Stall the flush loop by filling the ring? Simpler: the queue
        // bound is 2 and the flush loop may drain between sends, so pile
        // sends synchronously under the lock by sending before yielding.
        let mut failures = 0;
        for _ in 0..64 {
            let message = Message::new(MessageKind::Event, vec![0u8; 8]);
            if fabric.send(client, message).is_err() {
                failures += 1;
            }
        }
        // With a bound of 2 and no yields, most sends must have failed.
        assert!(failures > 0);
    }

    #[tokio::test]
    async fn channel_error_fails_pending_awaits() {
        let fabric = IpcFabric::new(fast_config());
        let (server, client) = ring_pair(&fabric, "fabric-dead-peer");
        fabric
            .wait_connected(client, Duration::from_secs(1))
            .await
            .unwrap();

        // Server never answers; closing it drops the ring, which the
        // client observes as a channel failure.
        let pending = {
            let fabric = fabric.clone();
            tokio::spawn(async move {
                let request = Message::new(MessageKind::Request, vec![]).with_route("void");
                fabric
                    .send_and_await(client, request, Some(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        fabric.close(server).await.unwrap();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(CoreError::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn notifications_reach_route_handlers() {
        let fabric = IpcFabric::new(fast_config());
        let (server, client) = ring_pair(&fabric, "fabric-notify");
        fabric
            .wait_connected(client, Duration::from_secs(1))
            .await
            .unwrap();

        let (tx, rx) = oneshot::channel::<Vec<u8>>();
        let tx = Mutex::new(Some(tx));
        fabric
            .register_handler(
                server,
                "telemetry",
                handler_fn(move |message| {
                    let sender = tx.lock().take();
                    async move {
                        if let Some(sender) = sender {
                            let _ = sender.send(message.payload);
                        }
                        None
                    }
                }),
            )
            .unwrap();

        fabric.notify(client, "telemetry", vec![9, 9, 9]).unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, vec![9, 9, 9]);
    }
}

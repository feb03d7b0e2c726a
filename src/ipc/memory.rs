//! In-process ring transport.
//!
//! A pair of bounded byte-frame rings connecting two endpoints inside one
//! process, addressed by ring name through a process-global rendezvous
//! table. This is the same-process analog of a shared-memory ring: fixed
//! slot count, writers park when the ring is full, readers park when it
//! is empty. Used by tests and by subsystems co-located with the
//! supervisor, where a socket hop would be pure overhead.

use std::sync::OnceLock;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{CoreError, CoreResult, NetworkErrorKind};
use crate::ipc::{Endpoint, FrameRead, FrameWrite, FramedPair, Transport, TransportKind};

/// Frames buffered per direction before writers suspend.
const RING_SLOTS: usize = 256;

type PendingAccept = oneshot::Sender<FramedPair>;

fn rendezvous() -> &'static DashMap<String, PendingAccept> {
    static TABLE: OnceLock<DashMap<String, PendingAccept>> = OnceLock::new();
    TABLE.get_or_init(DashMap::new)
}

/// In-process ring transport.
pub struct MemoryTransport;

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn connect(&mut self, endpoint: &Endpoint) -> CoreResult<FramedPair> {
        let (_, waiter) = rendezvous().remove(&endpoint.address).ok_or_else(|| {
            CoreError::transient(
                NetworkErrorKind::Refused,
                format!("no ring listener named {}", endpoint.address),
            )
        })?;

        let (client_tx, server_rx) = mpsc::channel::<Bytes>(RING_SLOTS);
        let (server_tx, client_rx) = mpsc::channel::<Bytes>(RING_SLOTS);

        let server_pair = FramedPair {
            reader: Box::new(RingReader { inner: server_rx }),
            writer: Box::new(RingWriter { inner: server_tx }),
        };
        waiter.send(server_pair).map_err(|_| {
            CoreError::transient(
                NetworkErrorKind::Refused,
                format!("ring listener {} went away", endpoint.address),
            )
        })?;
        debug!("memory ring {} connected", endpoint.address);

        Ok(FramedPair {
            reader: Box::new(RingReader { inner: client_rx }),
            writer: Box::new(RingWriter { inner: client_tx }),
        })
    }

    async fn accept(&mut self, endpoint: &Endpoint) -> CoreResult<FramedPair> {
        let (tx, rx) = oneshot::channel();
        if rendezvous().insert(endpoint.address.clone(), tx).is_some() {
            debug!("replacing stale ring listener {}", endpoint.address);
        }
        debug!("memory ring {} listening", endpoint.address);
        rx.await
            .map_err(|_| CoreError::ChannelClosed(format!("ring {} abandoned", endpoint.address)))
    }
}

struct RingReader {
    inner: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl FrameRead for RingReader {
    async fn read_frame(&mut self) -> CoreResult<Bytes> {
        self.inner
            .recv()
            .await
            .ok_or_else(|| CoreError::ChannelClosed("ring peer closed".into()))
    }
}

struct RingWriter {
    inner: mpsc::Sender<Bytes>,
}

#[async_trait]
impl FrameWrite for RingWriter {
    async fn write_frame(&mut self, frame: Bytes) -> CoreResult<()> {
        self.inner
            .send(frame)
            .await
            .map_err(|_| CoreError::ChannelClosed("ring peer closed".into()))
    }

    async fn shutdown(&mut self) -> CoreResult<()> {
        Ok(())
    }
}

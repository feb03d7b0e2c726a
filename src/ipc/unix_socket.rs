//! Unix domain socket transport for same-machine process pairs.
//!
//! The default transport between the supervisor and its child processes:
//! full-duplex, no network stack, path-addressed. Listener sockets are
//! unlinked before bind so a crashed predecessor's stale path does not
//! block restart.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::error::{CoreError, CoreResult, NetworkErrorKind};
use crate::ipc::{check_frame_len, Endpoint, FrameRead, FrameWrite, FramedPair, Transport, TransportKind};

const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Unix domain socket transport.
pub struct UnixSocketTransport;

impl Default for UnixSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixSocketTransport {
    pub fn new() -> Self {
        Self
    }

    fn split(stream: UnixStream) -> FramedPair {
        let (read_half, write_half) = stream.into_split();
        FramedPair {
            reader: Box::new(UnixFrameReader { inner: read_half }),
            writer: Box::new(UnixFrameWriter { inner: write_half }),
        }
    }
}

#[async_trait]
impl Transport for UnixSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalSocket
    }

    async fn connect(&mut self, endpoint: &Endpoint) -> CoreResult<FramedPair> {
        debug!("uds transport connecting to {}", endpoint.address);
        let stream = UnixStream::connect(&endpoint.address).await.map_err(|e| {
            CoreError::transient(
                NetworkErrorKind::Refused,
                format!("uds connect {}: {e}", endpoint.address),
            )
        })?;
        Ok(Self::split(stream))
    }

    async fn accept(&mut self, endpoint: &Endpoint) -> CoreResult<FramedPair> {
        let _ = std::fs::remove_file(&endpoint.address);
        let listener = UnixListener::bind(&endpoint.address)?;
        debug!("uds transport listening on {}", endpoint.address);
        let (stream, _) = listener.accept().await?;
        debug!("uds transport accepted peer on {}", endpoint.address);
        Ok(Self::split(stream))
    }

    fn max_frame_size(&self) -> usize {
        MAX_FRAME
    }
}

struct UnixFrameReader {
    inner: OwnedReadHalf,
}

#[async_trait]
impl FrameRead for UnixFrameReader {
    async fn read_frame(&mut self) -> CoreResult<Bytes> {
        let mut header = [0u8; 4];
        self.inner
            .read_exact(&mut header)
            .await
            .map_err(|e| CoreError::ChannelClosed(format!("uds read: {e}")))?;
        let body_len = u32::from_be_bytes(header) as usize;
        check_frame_len(body_len, MAX_FRAME)?;

        let mut frame = BytesMut::with_capacity(4 + body_len);
        frame.put_slice(&header);
        frame.resize(4 + body_len, 0);
        self.inner
            .read_exact(&mut frame[4..])
            .await
            .map_err(|e| CoreError::ChannelClosed(format!("uds read body: {e}")))?;
        Ok(frame.freeze())
    }
}

struct UnixFrameWriter {
    inner: OwnedWriteHalf,
}

#[async_trait]
impl FrameWrite for UnixFrameWriter {
    async fn write_frame(&mut self, frame: Bytes) -> CoreResult<()> {
        self.inner
            .write_all(&frame)
            .await
            .map_err(|e| CoreError::ChannelClosed(format!("uds write: {e}")))?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> CoreResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

//! TCP transport for channels that cross machine boundaries.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::error::{CoreError, CoreResult, NetworkErrorKind};
use crate::ipc::{check_frame_len, Endpoint, FrameRead, FrameWrite, FramedPair, Transport, TransportKind};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// TCP socket transport with low-latency socket options.
pub struct TcpTransport {
    buffer_size: usize,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            buffer_size: 64 * 1024,
        }
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self { buffer_size }
    }

    /// Disable Nagle and size the socket buffers.
    fn tune(&self, stream: TcpStream) -> CoreResult<TcpStream> {
        let std_stream = stream.into_std()?;
        let socket = socket2::Socket::from(std_stream.try_clone()?);
        socket.set_nodelay(true)?;
        socket.set_recv_buffer_size(self.buffer_size)?;
        socket.set_send_buffer_size(self.buffer_size)?;
        Ok(TcpStream::from_std(std_stream)?)
    }

    fn split(stream: TcpStream) -> FramedPair {
        let (read_half, write_half) = stream.into_split();
        FramedPair {
            reader: Box::new(TcpFrameReader { inner: read_half }),
            writer: Box::new(TcpFrameWriter { inner: write_half }),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn connect(&mut self, endpoint: &Endpoint) -> CoreResult<FramedPair> {
        let addr = format!("{}:{}", endpoint.address, endpoint.port);
        debug!("tcp transport connecting to {addr}");
        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            let kind = match e.kind() {
                std::io::ErrorKind::ConnectionRefused => NetworkErrorKind::Refused,
                std::io::ErrorKind::TimedOut => NetworkErrorKind::TimedOut,
                _ => NetworkErrorKind::Unreachable,
            };
            CoreError::transient(kind, format!("tcp connect {addr}: {e}"))
        })?;
        let stream = self.tune(stream)?;
        debug!("tcp transport connected to {addr}");
        Ok(Self::split(stream))
    }

    async fn accept(&mut self, endpoint: &Endpoint) -> CoreResult<FramedPair> {
        let addr = format!("{}:{}", endpoint.address, endpoint.port);
        let listener = TcpListener::bind(&addr).await?;
        debug!("tcp transport listening on {}", listener.local_addr()?);
        let (stream, peer) = listener.accept().await?;
        debug!("tcp transport accepted peer {peer}");
        let stream = self.tune(stream)?;
        Ok(Self::split(stream))
    }

    fn max_frame_size(&self) -> usize {
        MAX_FRAME
    }
}

struct TcpFrameReader {
    inner: OwnedReadHalf,
}

#[async_trait]
impl FrameRead for TcpFrameReader {
    async fn read_frame(&mut self) -> CoreResult<Bytes> {
        let mut header = [0u8; 4];
        self.inner.read_exact(&mut header).await.map_err(|e| {
            CoreError::ChannelClosed(format!("tcp read: {e}"))
        })?;
        let body_len = u32::from_be_bytes(header) as usize;
        check_frame_len(body_len, MAX_FRAME)?;

        let mut frame = BytesMut::with_capacity(4 + body_len);
        frame.put_slice(&header);
        frame.resize(4 + body_len, 0);
        self.inner
            .read_exact(&mut frame[4..])
            .await
            .map_err(|e| CoreError::ChannelClosed(format!("tcp read body: {e}")))?;
        Ok(frame.freeze())
    }
}

struct TcpFrameWriter {
    inner: OwnedWriteHalf,
}

#[async_trait]
impl FrameWrite for TcpFrameWriter {
    async fn write_frame(&mut self, frame: Bytes) -> CoreResult<()> {
        // A stalled peer means a full send buffer; bound the wait so the
        // flush loop can surface backpressure instead of hanging.
        let write = async {
            self.inner.write_all(&frame).await?;
            self.inner.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        match timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CoreError::ChannelClosed(format!("tcp write: {e}"))),
            Err(_) => Err(CoreError::ResourceExhausted(
                "tcp send buffer full past the write deadline".into(),
            )),
        }
    }

    async fn shutdown(&mut self) -> CoreResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

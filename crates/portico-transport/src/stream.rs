//! Framed stream transport
//!
//! Raw TCP (optionally wrapped in TLS) with length-prefixed framing.
//! Each frame is preceded by a 4-byte big-endian length prefix.
//!
//! The IO task owns the socket. Closing a [`FrameSender`] (or dropping
//! every clone of it) writes out the frames already queued and then shuts
//! the socket down; the receiver then observes
//! [`TransportEvent::Disconnected`]. Frames larger than the configured
//! maximum are refused by [`FrameSender`] with
//! [`TransportError::FrameTooLarge`].

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::error::{Result, TransportError};
use crate::traits::{TransportEvent, TransportReceiver, TransportSender};

/// Maximum frame size (64KB)
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default channel buffer size for stream connections
const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 1000;

/// Anything the framed IO loop can drive: plain TCP or a TLS stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// TCP configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Maximum frame size in bytes
    pub max_message_size: usize,
    /// Keep-alive interval in seconds (0 = disabled)
    pub keepalive_secs: u64,
    /// Upper bound on connect
    pub connect_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            keepalive_secs: 30,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// TCP transport
pub struct TcpTransport {
    config: TcpConfig,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            config: TcpConfig::default(),
        }
    }

    pub fn with_config(config: TcpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// Open a raw TCP connection, bounded by the connect timeout
    pub async fn open(&self, host: &str, port: u16) -> Result<TcpStream> {
        info!("Connecting to TCP: {}:{}", host, port);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        if self.config.keepalive_secs > 0 {
            let socket = socket2::SockRef::from(&stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(self.config.keepalive_secs));
            let _ = socket.set_tcp_keepalive(&keepalive);
        }

        Ok(stream)
    }

    /// Wrap an established stream in length-prefixed framing
    pub fn framed<S: AsyncStream>(&self, stream: S) -> (FrameSender, FrameReceiver) {
        frame_stream(stream, self.config.max_message_size)
    }

    /// Connect and frame in one step
    pub async fn connect(&self, host: &str, port: u16) -> Result<(FrameSender, FrameReceiver)> {
        let stream = self.open(host, port).await?;
        info!("TCP connected to {}:{}", host, port);
        Ok(self.framed(stream))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the IO task for `stream` and return its two halves
pub fn frame_stream<S: AsyncStream>(stream: S, max_size: usize) -> (FrameSender, FrameReceiver) {
    let connected = Arc::new(AtomicBool::new(true));
    let (close_tx, close_rx) = watch::channel(false);
    let (outgoing_tx, outgoing_rx) = mpsc::channel::<Bytes>(DEFAULT_CHANNEL_BUFFER_SIZE);
    let (incoming_tx, incoming_rx) = mpsc::channel::<TransportEvent>(DEFAULT_CHANNEL_BUFFER_SIZE);

    let sender = FrameSender {
        tx: outgoing_tx,
        max_size,
        connected: connected.clone(),
        close_tx: Arc::new(close_tx),
    };
    let receiver = FrameReceiver { rx: incoming_rx };

    tokio::spawn(run_io_loop(
        stream,
        outgoing_rx,
        incoming_tx,
        max_size,
        connected,
        close_rx,
    ));

    (sender, receiver)
}

/// Split complete frames off the front of `buf`
fn drain_frames(buf: &mut BytesMut, max_size: usize) -> std::result::Result<Vec<Bytes>, usize> {
    let mut frames = Vec::new();
    while buf.len() >= 4 {
        let len = (&buf[..4]).get_u32() as usize;
        if len > max_size {
            return Err(len);
        }
        if buf.len() < 4 + len {
            break;
        }
        buf.advance(4);
        frames.push(buf.split_to(len).freeze());
    }
    Ok(frames)
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    let mut frame = BytesMut::with_capacity(4 + data.len());
    frame.put_u32(data.len() as u32);
    frame.extend_from_slice(data);
    writer.write_all(&frame).await
}

/// Shared IO loop for framed connections
async fn run_io_loop<S: AsyncStream>(
    stream: S,
    mut outgoing_rx: mpsc::Receiver<Bytes>,
    incoming_tx: mpsc::Sender<TransportEvent>,
    max_size: usize,
    connected: Arc<AtomicBool>,
    mut close_rx: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut read_buf = BytesMut::with_capacity(8192);

    let reason = loop {
        tokio::select! {
            biased;

            Some(data) = outgoing_rx.recv() => {
                if let Err(e) = write_frame(&mut writer, &data).await {
                    error!("Stream write error: {}", e);
                    break Some(e.to_string());
                }
            }

            // Fires on close() and when every sender clone is dropped
            _ = close_rx.changed() => {
                // Frames queued before close still go out
                outgoing_rx.close();
                let mut failed = None;
                while let Some(data) = outgoing_rx.recv().await {
                    if let Err(e) = write_frame(&mut writer, &data).await {
                        error!("Stream write error while closing: {}", e);
                        failed = Some(e.to_string());
                        break;
                    }
                }
                let _ = writer.shutdown().await;
                break failed.or_else(|| Some("closed locally".to_string()));
            }

            result = reader.read_buf(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        debug!("Stream closed by peer");
                        break None;
                    }
                    Ok(_) => match drain_frames(&mut read_buf, max_size) {
                        Ok(frames) => {
                            let mut receiver_gone = false;
                            for data in frames {
                                if incoming_tx.send(TransportEvent::Data(data)).await.is_err() {
                                    receiver_gone = true;
                                    break;
                                }
                            }
                            if receiver_gone {
                                break None;
                            }
                        }
                        Err(len) => {
                            error!("Frame too large: {} > {}", len, max_size);
                            break Some(format!("frame too large: {}", len));
                        }
                    },
                    Err(e) => {
                        error!("Stream read error: {}", e);
                        let _ = incoming_tx.send(TransportEvent::Error(e.to_string())).await;
                        break Some(e.to_string());
                    }
                }
            }
        }
    };

    connected.store(false, Ordering::SeqCst);
    let _ = incoming_tx
        .send(TransportEvent::Disconnected { reason })
        .await;
}

/// Sending half of a framed connection
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Bytes>,
    max_size: usize,
    connected: Arc<AtomicBool>,
    close_tx: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl TransportSender for FrameSender {
    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if data.len() > self.max_size {
            return Err(TransportError::FrameTooLarge(data.len()));
        }

        self.tx
            .send(data)
            .await
            .map_err(|_| TransportError::SendFailed("Channel closed".into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.close_tx.send_replace(true);
        Ok(())
    }
}

/// Receiving half of a framed connection
pub struct FrameReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for FrameReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// TCP listener with an explicit backlog
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    /// Bind `host:port` and start listening with `backlog` pending connections
    pub async fn bind(host: &str, port: u16, backlog: u32) -> Result<Self> {
        let addr = resolve(host, port).await?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        socket
            .set_reuseaddr(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .bind(addr)
            .map_err(|e| TransportError::BindFailed(format!("{}: {}", addr, e)))?;
        let listener = socket
            .listen(backlog)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        info!("TCP server listening on {} (backlog {})", addr, backlog);
        Ok(Self { listener })
    }

    /// Accept the next raw connection
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::AcceptFailed(e.to_string()))?;

        info!("TCP connection accepted from {}", peer_addr);
        Ok((stream, peer_addr))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(TransportError::Io)
    }
}

/// Resolve `host:port` to the first socket address
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::Resolve(format!("{}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| TransportError::Resolve(format!("{}:{}: no addresses", host, port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_config_default() {
        let config = TcpConfig::default();
        assert_eq!(config.max_message_size, 64 * 1024);
        assert_eq!(config.keepalive_secs, 30);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_drain_frames_partial() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.extend_from_slice(b"hel");
        assert!(drain_frames(&mut buf, 1024).unwrap().is_empty());

        buf.extend_from_slice(b"lo");
        buf.put_u32(2);
        buf.extend_from_slice(b"ok");
        let frames = drain_frames(&mut buf, 1024).unwrap();
        assert_eq!(frames, vec![Bytes::from("hello"), Bytes::from("ok")]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drain_frames_rejects_oversize() {
        let mut buf = BytesMut::new();
        buf.put_u32(10_000);
        assert_eq!(drain_frames(&mut buf, 1024), Err(10_000));
    }
}

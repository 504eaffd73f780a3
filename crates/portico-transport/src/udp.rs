//! UDP transport implementation

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::error::{Result, TransportError};
use crate::traits::{TransportEvent, TransportReceiver};

/// UDP configuration
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Maximum packet size
    pub max_packet_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 65507, // Max UDP payload
        }
    }
}

/// UDP transport (connectionless)
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    config: UdpConfig,
    close_tx: watch::Sender<bool>,
}

impl UdpTransport {
    /// Bind to a local address
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, UdpConfig::default()).await
    }

    /// Bind with config
    pub async fn bind_with_config(addr: &str, config: UdpConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{}: {}", addr, e)))?;

        info!("UDP bound to {}", socket.local_addr()?);

        let (close_tx, _) = watch::channel(false);
        Ok(Self {
            socket: Arc::new(socket),
            config,
            close_tx,
        })
    }

    /// Bind an ephemeral local socket for sending only
    pub async fn ephemeral(remote: SocketAddr) -> Result<Self> {
        let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        Self::bind(local).await
    }

    /// Get local address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    /// Start receiving packets until [`UdpTransport::close`] is called
    pub fn start_receiver(&self) -> UdpReceiver {
        let (tx, rx) = mpsc::channel(100);
        let socket = self.socket.clone();
        let max_size = self.config.max_packet_size;
        let mut close_rx = self.close_tx.subscribe();

        tokio::spawn(async move {
            let mut buf = vec![0u8; max_size];

            loop {
                tokio::select! {
                    _ = close_rx.changed() => {
                        debug!("UDP receiver closed");
                        break;
                    }
                    result = socket.recv_from(&mut buf) => match result {
                        Ok((len, from)) => {
                            debug!("UDP received {} bytes from {}", len, from);
                            let data = Bytes::copy_from_slice(&buf[..len]);
                            if tx.send((TransportEvent::Data(data), from)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            error!("UDP receive error: {}", e);
                            if tx
                                .send((
                                    TransportEvent::Error(e.to_string()),
                                    SocketAddr::from(([0, 0, 0, 0], 0)),
                                ))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
            }

            let _ = tx
                .send((
                    TransportEvent::Disconnected { reason: None },
                    SocketAddr::from(([0, 0, 0, 0], 0)),
                ))
                .await;
        });

        UdpReceiver { rx }
    }

    /// Send to a specific address
    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        self.socket
            .send_to(data, target)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    /// Stop any running receiver
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }
}

/// UDP receiver
pub struct UdpReceiver {
    rx: mpsc::Receiver<(TransportEvent, SocketAddr)>,
}

impl UdpReceiver {
    /// Receive the next event with source address
    pub async fn recv_from(&mut self) -> Option<(TransportEvent, SocketAddr)> {
        self.rx.recv().await
    }
}

#[async_trait]
impl TransportReceiver for UdpReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await.map(|(event, _)| event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_bind() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[tokio::test]
    async fn test_udp_send_recv() {
        let server = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let client = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        let server_addr = server.local_addr().unwrap();
        let mut receiver = server.start_receiver();

        client.send_to(b"hello", server_addr).await.unwrap();

        let (event, from) = receiver.recv_from().await.unwrap();
        match event {
            TransportEvent::Data(data) => {
                assert_eq!(data.as_ref(), b"hello");
            }
            _ => panic!("Expected Data event"),
        }

        assert_eq!(from.port(), client.local_addr().unwrap().port());
    }

    #[tokio::test]
    async fn test_udp_close_stops_receiver() {
        let server = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let mut receiver = server.start_receiver();

        server.close();

        let (event, _) = receiver.recv_from().await.unwrap();
        assert!(matches!(event, TransportEvent::Disconnected { .. }));
    }
}

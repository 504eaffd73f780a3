//! Outbound side of a bound handler
//!
//! A [`Link`] is what a handler talks back through. It is cheap to clone
//! and carries the endpoint identity, the remote peer (when there is one)
//! and the protocols the endpoint offered.

use bytes::Bytes;
use portico_core::{codec, Envelope};
use portico_transport::{FrameSender, TransportSender, UdpTransport};
use rumqttc::{AsyncClient, QoS};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{EngineError, Result};

#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    endpoint: String,
    peer: Option<SocketAddr>,
    protocols: Vec<String>,
    outbound: Outbound,
}

enum Outbound {
    Stream(FrameSender),
    Datagram {
        transport: Arc<UdpTransport>,
        default_peer: Option<SocketAddr>,
        open: AtomicBool,
    },
    Mqtt {
        client: AsyncClient,
        default_qos: QoS,
        open: AtomicBool,
    },
}

pub(crate) fn qos(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

impl Link {
    fn new(endpoint: &str, peer: Option<SocketAddr>, protocols: Vec<String>, outbound: Outbound) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                endpoint: endpoint.to_string(),
                peer,
                protocols,
                outbound,
            }),
        }
    }

    pub(crate) fn stream(
        endpoint: &str,
        peer: Option<SocketAddr>,
        protocols: Vec<String>,
        sender: FrameSender,
    ) -> Self {
        Self::new(endpoint, peer, protocols, Outbound::Stream(sender))
    }

    pub(crate) fn datagram(
        endpoint: &str,
        transport: Arc<UdpTransport>,
        default_peer: Option<SocketAddr>,
        protocols: Vec<String>,
    ) -> Self {
        Self::new(
            endpoint,
            default_peer,
            protocols,
            Outbound::Datagram {
                transport,
                default_peer,
                open: AtomicBool::new(true),
            },
        )
    }

    pub(crate) fn mqtt(endpoint: &str, client: AsyncClient, default_qos: u8, protocols: Vec<String>) -> Self {
        Self::new(
            endpoint,
            None,
            protocols,
            Outbound::Mqtt {
                client,
                default_qos: qos(default_qos),
                open: AtomicBool::new(true),
            },
        )
    }

    /// Identifier of the endpoint this link belongs to
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Remote address: the connected peer, or the default UDP target
    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Protocols the endpoint offers, in preference order
    pub fn offered_protocols(&self) -> &[String] {
        &self.inner.protocols
    }

    /// "tcp", "udp" or "mqtt"
    pub fn kind(&self) -> &'static str {
        match &self.inner.outbound {
            Outbound::Stream(_) => "tcp",
            Outbound::Datagram { .. } => "udp",
            Outbound::Mqtt { .. } => "mqtt",
        }
    }

    pub fn is_open(&self) -> bool {
        match &self.inner.outbound {
            Outbound::Stream(sender) => sender.is_connected(),
            Outbound::Datagram { open, .. } | Outbound::Mqtt { open, .. } => {
                open.load(Ordering::SeqCst)
            }
        }
    }

    /// Send one frame to the peer (TCP) or one datagram to the default target (UDP)
    pub async fn send(&self, data: Bytes) -> Result<()> {
        match &self.inner.outbound {
            Outbound::Stream(sender) => Ok(sender.send(data).await?),
            Outbound::Datagram {
                default_peer: Some(target),
                ..
            } => self.send_to(data, *target).await,
            Outbound::Datagram { .. } => Err(EngineError::Unsupported {
                link: "udp",
                op: "send without a default peer",
            }),
            Outbound::Mqtt { .. } => Err(EngineError::Unsupported {
                link: "mqtt",
                op: "send",
            }),
        }
    }

    /// MessagePack-encode `envelope` and [`send`](Self::send) it
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.send(codec::encode(envelope)?).await
    }

    /// Send one datagram to `target`
    pub async fn send_to(&self, data: Bytes, target: SocketAddr) -> Result<()> {
        match &self.inner.outbound {
            Outbound::Datagram { transport, open, .. } => {
                if !open.load(Ordering::SeqCst) {
                    return Err(portico_transport::TransportError::NotConnected.into());
                }
                Ok(transport.send_to(&data, target).await?)
            }
            _ => Err(EngineError::Unsupported {
                link: self.kind(),
                op: "send_to",
            }),
        }
    }

    /// Publish to `topic`; `qos` falls back to the instance default
    pub async fn publish(&self, topic: &str, payload: Bytes, qos_level: Option<u8>) -> Result<()> {
        match &self.inner.outbound {
            Outbound::Mqtt {
                client,
                default_qos,
                ..
            } => {
                let level = qos_level.map(qos).unwrap_or(*default_qos);
                client.publish(topic, level, false, payload.to_vec()).await?;
                Ok(())
            }
            _ => Err(EngineError::Unsupported {
                link: self.kind(),
                op: "publish",
            }),
        }
    }

    /// JSON-encode `envelope` and [`publish`](Self::publish) it
    pub async fn publish_envelope(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        self.publish(topic, codec::encode_json(envelope)?, None).await
    }

    pub async fn subscribe(&self, topic: &str, qos_level: Option<u8>) -> Result<()> {
        match &self.inner.outbound {
            Outbound::Mqtt {
                client,
                default_qos,
                ..
            } => {
                let level = qos_level.map(qos).unwrap_or(*default_qos);
                client.subscribe(topic, level).await?;
                Ok(())
            }
            _ => Err(EngineError::Unsupported {
                link: self.kind(),
                op: "subscribe",
            }),
        }
    }

    /// Release the underlying resource. The dispatch loop observes the
    /// closure and ends.
    pub async fn close(&self) {
        debug!(endpoint = %self.endpoint(), "closing {} link", self.kind());
        match &self.inner.outbound {
            Outbound::Stream(sender) => {
                let _ = sender.close().await;
            }
            Outbound::Datagram { transport, open, .. } => {
                open.store(false, Ordering::SeqCst);
                transport.close();
            }
            Outbound::Mqtt { client, open, .. } => {
                if open.swap(false, Ordering::SeqCst) {
                    let _ = client.disconnect().await;
                }
            }
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("endpoint", &self.inner.endpoint)
            .field("kind", &self.kind())
            .field("peer", &self.inner.peer)
            .finish()
    }
}

//! UDP runtime
//!
//! `bind = true` binds host:port and hands each datagram to the handler.
//! `bind = false` binds an ephemeral local socket and targets host:port;
//! nothing is received and the handler is only reachable through [`Link`].

use async_trait::async_trait;
use portico_core::{LifecycleState, StateCell};
use portico_transport::stream::resolve;
use portico_transport::{UdpConfig, UdpTransport};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::{error, info};

use super::{transition, Endpoint, EndpointKind, SHUTDOWN_GRACE};
use crate::config::UdpInfos;
use crate::error::Result;
use crate::handler::{BoundHandler, DatagramSink, HandlerCatalog, ProtocolHandler, Source};
use crate::link::Link;

pub struct UdpRuntime {
    id: String,
    infos: UdpInfos,
    catalog: Arc<HandlerCatalog>,
    state: StateCell,
    lifecycle: Mutex<()>,
    local_addr: OnceLock<SocketAddr>,
    handler: OnceLock<Arc<BoundHandler>>,
}

impl UdpRuntime {
    pub fn new(id: impl Into<String>, infos: UdpInfos, catalog: Arc<HandlerCatalog>) -> Self {
        Self {
            id: id.into(),
            infos,
            catalog,
            state: StateCell::new(),
            lifecycle: Mutex::new(()),
            local_addr: OnceLock::new(),
            handler: OnceLock::new(),
        }
    }

    pub fn infos(&self) -> &UdpInfos {
        &self.infos
    }

    pub fn state_cell(&self) -> &StateCell {
        &self.state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn handler(&self) -> Option<Arc<BoundHandler>> {
        self.handler.get().cloned()
    }

    /// Direct access to the socket for sends
    pub fn link(&self) -> Option<Link> {
        self.handler.get().map(|h| h.link().clone())
    }

    async fn init_locked(&self) -> LifecycleState {
        if self.state.get() != LifecycleState::Down {
            return self.state.get();
        }

        match self.acquire().await {
            Ok(bound) => {
                info!(
                    endpoint = %self.id,
                    "UDP {} {}:{} (local {:?})",
                    if self.infos.bind { "bound to" } else { "sending to" },
                    self.infos.host,
                    self.infos.port,
                    self.local_addr()
                );
                let _ = self.handler.set(Arc::new(bound));
                transition(&self.id, &self.state, LifecycleState::Ready)
            }
            Err(e) => {
                error!(
                    endpoint = %self.id,
                    "UDP setup on {}:{} failed: {}",
                    self.infos.host, self.infos.port, e
                );
                transition(&self.id, &self.state, LifecycleState::Broken)
            }
        }
    }

    async fn acquire(&self) -> Result<BoundHandler> {
        self.infos.validate()?;
        let (identity, handler): (&str, Box<dyn ProtocolHandler>) = match &self.infos.handler {
            Some(identity) => (identity.as_str(), self.catalog.resolve(identity)?),
            None => ("sink", Box::new(DatagramSink) as Box<dyn ProtocolHandler>),
        };
        let protocols: Vec<String> = self.infos.handler.iter().cloned().collect();
        let addr = resolve(&self.infos.host, self.infos.port).await?;

        let (link, source) = if self.infos.bind {
            let config = UdpConfig {
                max_packet_size: self.infos.max_packet_size,
            };
            let transport = Arc::new(UdpTransport::bind_with_config(&addr.to_string(), config).await?);
            let receiver = transport.start_receiver();
            let _ = self.local_addr.set(transport.local_addr()?);
            (
                Link::datagram(&self.id, transport, None, protocols),
                Source::Datagram(receiver),
            )
        } else {
            let transport = Arc::new(UdpTransport::ephemeral(addr).await?);
            let _ = self.local_addr.set(transport.local_addr()?);
            (
                Link::datagram(&self.id, transport, Some(addr), protocols),
                Source::Idle,
            )
        };

        Ok(BoundHandler::bind(identity, handler, link, source))
    }
}

#[async_trait]
impl Endpoint for UdpRuntime {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Udp
    }

    fn state(&self) -> LifecycleState {
        self.state.get()
    }

    async fn init(&self) -> LifecycleState {
        let _guard = self.lifecycle.lock().await;
        self.init_locked().await
    }

    async fn run(&self) -> LifecycleState {
        let _guard = self.lifecycle.lock().await;
        match self.init_locked().await {
            LifecycleState::Ready => {
                if let Some(handler) = self.handler.get() {
                    handler.start();
                }
                transition(&self.id, &self.state, LifecycleState::Running)
            }
            LifecycleState::Running => LifecycleState::Running,
            other => {
                error!(endpoint = %self.id, "UDP handler is {}, not started", other);
                other
            }
        }
    }

    async fn shutdown(&self) {
        if let Some(handler) = self.handler.get() {
            handler.shutdown(SHUTDOWN_GRACE).await;
            info!(endpoint = %self.id, "UDP handler stopped");
        }
    }
}

impl std::fmt::Debug for UdpRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpRuntime")
            .field("id", &self.id)
            .field("bind", &self.infos.bind)
            .field("state", &self.state.get())
            .finish()
    }
}

//! TCP client runtime

use async_trait::async_trait;
use portico_core::{LifecycleState, StateCell};
use portico_transport::{TcpConfig, TcpTransport, TlsProvider};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info};

use super::{transition, Endpoint, EndpointKind, SHUTDOWN_GRACE};
use crate::config::ClientInfos;
use crate::error::{EngineError, Result};
use crate::handler::{BoundHandler, HandlerCatalog, Source};
use crate::link::Link;

/// Outbound TCP connection (plain or TLS) bound to one handler
pub struct ClientRuntime {
    id: String,
    infos: ClientInfos,
    catalog: Arc<HandlerCatalog>,
    state: StateCell,
    lifecycle: Mutex<()>,
    handler: OnceLock<Arc<BoundHandler>>,
}

impl ClientRuntime {
    pub fn new(id: impl Into<String>, infos: ClientInfos, catalog: Arc<HandlerCatalog>) -> Self {
        Self {
            id: id.into(),
            infos,
            catalog,
            state: StateCell::new(),
            lifecycle: Mutex::new(()),
            handler: OnceLock::new(),
        }
    }

    pub fn infos(&self) -> &ClientInfos {
        &self.infos
    }

    pub fn state_cell(&self) -> &StateCell {
        &self.state
    }

    /// The bound handler, if `init` succeeded
    pub fn handler(&self) -> Option<Arc<BoundHandler>> {
        self.handler.get().cloned()
    }

    /// Wait until the handler is bound and its loop has begun
    pub async fn handler_safe(&self, timeout: Duration) -> Result<Arc<BoundHandler>> {
        let deadline = Instant::now() + timeout;

        let state = self
            .state
            .wait_for(|s| s.is_terminal(), timeout)
            .await
            .map_err(|_| EngineError::Timeout)?;
        if state != LifecycleState::Running {
            return Err(EngineError::NotReady(state));
        }

        let handler = self
            .handler()
            .ok_or(EngineError::NotReady(LifecycleState::Down))?;
        handler
            .wait_running(deadline.saturating_duration_since(Instant::now()))
            .await?;
        Ok(handler)
    }

    async fn init_locked(&self) -> LifecycleState {
        if self.state.get() != LifecycleState::Down {
            return self.state.get();
        }

        match self.acquire().await {
            Ok(bound) => {
                info!(
                    endpoint = %self.id,
                    "Connected to {}:{} ({})",
                    self.infos.host, self.infos.port, self.infos.protocol
                );
                let _ = self.handler.set(Arc::new(bound));
                transition(&self.id, &self.state, LifecycleState::Ready)
            }
            Err(e) => {
                error!(
                    endpoint = %self.id,
                    "Client failed to connect to {}:{}: {}",
                    self.infos.host, self.infos.port, e
                );
                transition(&self.id, &self.state, LifecycleState::Broken)
            }
        }
    }

    async fn acquire(&self) -> Result<BoundHandler> {
        self.infos.validate()?;
        let handler = self.catalog.resolve(&self.infos.protocol)?;
        let timeout = self.infos.connect_timeout();

        let connector = match &self.infos.tls {
            Some(tls) => {
                let name = tls.server_name.as_deref().unwrap_or(&self.infos.host);
                Some((
                    TlsProvider::client(&tls.files())?,
                    TlsProvider::server_name(name)?,
                ))
            }
            None => None,
        };

        let transport = TcpTransport::with_config(TcpConfig {
            connect_timeout: timeout,
            ..Default::default()
        });
        let stream = transport.open(&self.infos.host, self.infos.port).await?;
        let peer = stream.peer_addr().ok();

        let (sender, receiver) = match connector {
            Some((connector, name)) => {
                let tls_stream = tokio::time::timeout(timeout, connector.connect(name, stream))
                    .await
                    .map_err(|_| EngineError::Timeout)??;
                transport.framed(tls_stream)
            }
            None => transport.framed(stream),
        };

        let link = Link::stream(&self.id, peer, vec![self.infos.protocol.clone()], sender);
        Ok(BoundHandler::bind(
            &self.infos.protocol,
            handler,
            link,
            Source::Stream(receiver),
        ))
    }
}

#[async_trait]
impl Endpoint for ClientRuntime {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Client
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
                error!(endpoint = %self.id, "Client is {}, handler not started", other);
                other
            }
        }
    }

    async fn shutdown(&self) {
        if let Some(handler) = self.handler.get() {
            handler.shutdown(SHUTDOWN_GRACE).await;
            info!(endpoint = %self.id, "Client stopped");
        }
    }
}

impl std::fmt::Debug for ClientRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRuntime")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .finish()
    }
}

//! TCP server runtime
//!
//! The server's own state tracks the listening socket. Every accepted
//! connection becomes a [`Session`] with a state machine of its own, so a
//! failed handshake breaks that session and nothing else.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use portico_core::{LifecycleState, StateCell};
use portico_transport::stream::frame_stream;
use portico_transport::{TcpConfig, TcpServer, TlsProvider};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::{transition, Endpoint, EndpointKind, SHUTDOWN_GRACE};
use crate::config::ServerInfos;
use crate::error::{EngineError, Result};
use crate::handler::{wait_shutdown, BoundHandler, HandlerCatalog, Source};
use crate::link::Link;

/// One accepted connection
pub struct Session {
    id: u64,
    peer: SocketAddr,
    state: StateCell,
    handler: OnceLock<Arc<BoundHandler>>,
}

impl Session {
    fn new(id: u64, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            state: StateCell::new(),
            handler: OnceLock::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    pub fn handler(&self) -> Option<Arc<BoundHandler>> {
        self.handler.get().cloned()
    }

    /// Broken, or its handler loop has ended
    pub fn is_finished(&self) -> bool {
        match self.state.get() {
            LifecycleState::Broken => true,
            _ => self.handler.get().is_some_and(|h| h.is_finished()),
        }
    }

    async fn shutdown(&self) {
        if let Some(handler) = self.handler.get() {
            handler.shutdown(SHUTDOWN_GRACE).await;
        }
    }

    async fn establish(&self, stream: TcpStream, ctx: &SessionContext) {
        let label = format!("{}#{}", ctx.endpoint, self.id);
        match self.bind(stream, ctx).await {
            Ok(bound) => {
                let bound = Arc::new(bound);
                let _ = self.handler.set(bound.clone());
                transition(&label, &self.state, LifecycleState::Ready);

                let stopping = *ctx.shutdown.borrow();
                if stopping {
                    bound.shutdown(SHUTDOWN_GRACE).await;
                    return;
                }
                bound.start();
                transition(&label, &self.state, LifecycleState::Running);
            }
            Err(e) => {
                error!(endpoint = %ctx.endpoint, "Session with {} failed: {}", self.peer, e);
                transition(&label, &self.state, LifecycleState::Broken);
            }
        }
    }

    async fn bind(&self, stream: TcpStream, ctx: &SessionContext) -> Result<BoundHandler> {
        let protocol = ctx
            .protocols
            .first()
            .ok_or_else(|| EngineError::Config("server offers no protocols".to_string()))?;
        let handler = ctx.catalog.resolve(protocol)?;

        let (sender, receiver) = match &ctx.acceptor {
            Some(acceptor) => {
                let tls_stream = tokio::time::timeout(ctx.handshake_timeout, acceptor.accept(stream))
                    .await
                    .map_err(|_| EngineError::Timeout)??;
                debug!(endpoint = %ctx.endpoint, "TLS handshake with {} complete", self.peer);
                frame_stream(tls_stream, ctx.max_frame)
            }
            None => frame_stream(stream, ctx.max_frame),
        };

        let link = Link::stream(&ctx.endpoint, Some(self.peer), ctx.protocols.clone(), sender);
        Ok(BoundHandler::bind(protocol, handler, link, Source::Stream(receiver)))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state.get())
            .finish()
    }
}

/// What every session of one server shares
struct SessionContext {
    endpoint: String,
    protocols: Vec<String>,
    catalog: Arc<HandlerCatalog>,
    acceptor: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    max_frame: usize,
    shutdown: watch::Receiver<bool>,
}

/// Listening TCP endpoint
pub struct ServerRuntime {
    id: String,
    infos: ServerInfos,
    catalog: Arc<HandlerCatalog>,
    state: StateCell,
    lifecycle: Mutex<()>,
    listener: SyncMutex<Option<(TcpServer, Option<TlsAcceptor>)>>,
    local_addr: OnceLock<SocketAddr>,
    sessions: Arc<DashMap<u64, Arc<Session>>>,
    shutdown: watch::Sender<bool>,
    accept_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl ServerRuntime {
    pub fn new(id: impl Into<String>, infos: ServerInfos, catalog: Arc<HandlerCatalog>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id: id.into(),
            infos,
            catalog,
            state: StateCell::new(),
            lifecycle: Mutex::new(()),
            listener: SyncMutex::new(None),
            local_addr: OnceLock::new(),
            sessions: Arc::new(DashMap::new()),
            shutdown,
            accept_task: SyncMutex::new(None),
        }
    }

    pub fn infos(&self) -> &ServerInfos {
        &self.infos
    }

    pub fn state_cell(&self) -> &StateCell {
        &self.state
    }

    /// Bound address, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Live sessions, oldest first. Finished sessions are pruned.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.retain(|_, s| !s.is_finished());
        let mut live: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        live.sort_by_key(|s| s.id());
        live
    }

    async fn init_locked(&self) -> LifecycleState {
        if self.state.get() != LifecycleState::Down {
            return self.state.get();
        }

        match self.acquire().await {
            Ok((listener, acceptor)) => {
                if let Ok(addr) = listener.local_addr() {
                    let _ = self.local_addr.set(addr);
                }
                info!(
                    endpoint = %self.id,
                    "Server listening on {}:{} offering {:?}{}",
                    self.infos.host,
                    self.local_addr().map(|a| a.port()).unwrap_or(self.infos.port),
                    self.infos.protocols,
                    if acceptor.is_some() { " (TLS)" } else { "" }
                );
                *self.listener.lock() = Some((listener, acceptor));
                transition(&self.id, &self.state, LifecycleState::Ready)
            }
            Err(e) => {
                error!(
                    endpoint = %self.id,
                    "Server failed to listen on {}:{}: {}",
                    self.infos.host, self.infos.port, e
                );
                transition(&self.id, &self.state, LifecycleState::Broken)
            }
        }
    }

    async fn acquire(&self) -> Result<(TcpServer, Option<TlsAcceptor>)> {
        self.infos.validate()?;
        self.catalog
            .check(self.infos.protocols.iter().map(String::as_str))?;

        let acceptor = match &self.infos.tls {
            Some(tls) => Some(TlsProvider::server(&tls.cert_file, &tls.key_file)?),
            None => None,
        };
        let listener = TcpServer::bind(&self.infos.host, self.infos.port, self.infos.backlog).await?;
        Ok((listener, acceptor))
    }

    fn spawn_accept_loop(&self, listener: TcpServer, acceptor: Option<TlsAcceptor>) -> JoinHandle<()> {
        let ctx = Arc::new(SessionContext {
            endpoint: self.id.clone(),
            protocols: self.infos.protocols.clone(),
            catalog: self.catalog.clone(),
            acceptor,
            handshake_timeout: self.infos.handshake_timeout(),
            max_frame: TcpConfig::default().max_message_size,
            shutdown: self.shutdown.subscribe(),
        });
        let sessions = self.sessions.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut next_id: u64 = 0;
            loop {
                tokio::select! {
                    _ = wait_shutdown(&mut shutdown_rx) => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            sessions.retain(|_, s| !s.is_finished());
                            next_id += 1;

                            let session = Arc::new(Session::new(next_id, peer));
                            sessions.insert(next_id, session.clone());

                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                session.establish(stream, &ctx).await;
                            });
                        }
                        Err(e) => warn!(endpoint = %ctx.endpoint, "Accept failed: {}", e),
                    }
                }
            }
            debug!(endpoint = %ctx.endpoint, "Accept loop stopped");
        })
    }
}

#[async_trait]
impl Endpoint for ServerRuntime {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Server
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
                let listener = self.listener.lock().take();
                if let Some((listener, acceptor)) = listener {
                    *self.accept_task.lock() = Some(self.spawn_accept_loop(listener, acceptor));
                }
                transition(&self.id, &self.state, LifecycleState::Running)
            }
            LifecycleState::Running => LifecycleState::Running,
            other => {
                error!(endpoint = %self.id, "Server is {}, not accepting", other);
                other
            }
        }
    }

    async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.listener.lock().take();

        let task = self.accept_task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }

        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        futures::future::join_all(sessions.iter().map(|s| s.shutdown())).await;
        self.sessions.clear();
        info!(endpoint = %self.id, "Server stopped");
    }
}

impl std::fmt::Debug for ServerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRuntime")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

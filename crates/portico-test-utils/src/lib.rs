//! Common test helpers for portico tests
//!
//! - Port allocation
//! - Condition-based waiting (no hardcoded sleeps)
//! - A recording protocol handler
//! - A framed TCP echo peer
//! - Self-signed TLS material on disk

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use portico_engine::{Inbound, Link, ProtocolHandler};
use portico_transport::{TcpServer, TcpTransport, TransportEvent, TransportReceiver, TransportSender};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Port Allocation
// ============================================================================

/// Find an available TCP port for testing
pub async fn find_available_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Find an available UDP port for testing
pub fn find_available_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

/// A TCP port with nothing listening on it
pub async fn find_closed_port() -> u16 {
    // The listener is dropped on return, so the port is free and refuses connects
    find_available_port().await
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Wait for an atomic counter to reach a target value
pub async fn wait_for_count(counter: &AtomicU32, target: u32, max_wait: Duration) -> bool {
    wait_for(
        || async { counter.load(Ordering::SeqCst) >= target },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

/// Wait for a boolean flag to become true
pub async fn wait_for_flag(flag: &AtomicBool, max_wait: Duration) -> bool {
    wait_for(
        || async { flag.load(Ordering::SeqCst) },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

// ============================================================================
// Recording Handler
// ============================================================================

/// Shared log of what a [`RecordingHandler`] saw
#[derive(Default)]
pub struct Recorder {
    inbound: Mutex<Vec<Inbound>>,
    opened: AtomicU32,
    closed: AtomicU32,
    notify: Notify,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A factory suitable for `HandlerCatalog::register`
    pub fn factory(self: &Arc<Self>, echo: bool) -> impl Fn() -> RecordingHandler + Send + Sync + 'static {
        let recorder = self.clone();
        move || RecordingHandler {
            recorder: recorder.clone(),
            echo,
        }
    }

    pub fn messages(&self) -> Vec<Inbound> {
        self.inbound.lock().clone()
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.inbound.lock().iter().map(|i| i.payload().clone()).collect()
    }

    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` messages were recorded
    pub async fn wait_for_messages(&self, count: usize, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.notify.notified();
            if self.inbound.lock().len() >= count {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || timeout(remaining, notified).await.is_err() {
                return self.inbound.lock().len() >= count;
            }
        }
    }

    pub async fn wait_for_close(&self, max_wait: Duration) -> bool {
        wait_for(
            || async { self.closed() > 0 },
            DEFAULT_CHECK_INTERVAL,
            max_wait,
        )
        .await
    }
}

/// Records every event; optionally echoes frames and datagrams
pub struct RecordingHandler {
    recorder: Arc<Recorder>,
    echo: bool,
}

#[async_trait]
impl ProtocolHandler for RecordingHandler {
    async fn on_open(&mut self, _link: &Link) -> anyhow::Result<()> {
        self.recorder.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_message(&mut self, link: &Link, inbound: Inbound) -> anyhow::Result<()> {
        if self.echo {
            match &inbound {
                Inbound::Frame(data) => link.send(data.clone()).await?,
                Inbound::Datagram { payload, from } => link.send_to(payload.clone(), *from).await?,
                Inbound::Publish { .. } => {}
            }
        }
        self.recorder.inbound.lock().push(inbound);
        self.recorder.notify.notify_waiters();
        Ok(())
    }

    async fn on_close(&mut self, _link: &Link) {
        self.recorder.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Echo Peer - RAII wrapper with proper cleanup
// ============================================================================

/// A framed TCP peer that echoes every frame, aborted on drop
pub struct EchoPeer {
    port: u16,
    accepted: Arc<AtomicU32>,
    handle: Option<JoinHandle<()>>,
}

impl EchoPeer {
    pub async fn start() -> Self {
        let server = TcpServer::bind("127.0.0.1", 0, 16).await.unwrap();
        let port = server.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicU32::new(0));
        let counter = accepted.clone();

        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = server.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let (sender, mut receiver) = TcpTransport::new().framed(stream);
                tokio::spawn(async move {
                    while let Some(TransportEvent::Data(data)) = receiver.recv().await {
                        if sender.send(data).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Self {
            port,
            accepted,
            handle: Some(handle),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn accepted(&self) -> u32 {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for EchoPeer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

// ============================================================================
// TLS Material
// ============================================================================

static MATERIAL_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Self-signed certificate for `localhost` written to a temp dir, removed on drop
pub struct TlsMaterial {
    dir: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsMaterial {
    pub fn generate() -> Self {
        let n = MATERIAL_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("portico-test-{}-{}", std::process::id(), n));
        std::fs::create_dir_all(&dir).unwrap();

        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
        std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

        Self {
            dir,
            cert: cert_path,
            key: key_path,
        }
    }

    /// Write an extra file next to the material
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }
}

impl Drop for TlsMaterial {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

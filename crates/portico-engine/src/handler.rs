//! Protocol handler contract and resolution
//!
//! Applications register handler factories under an identity string in a
//! [`HandlerCatalog`] at startup. Runtimes look identities up at launch
//! and bind the fresh handler to a live [`Link`], producing a
//! [`BoundHandler`] that owns the receive/dispatch loop.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use portico_core::{codec, Envelope};
use portico_transport::{FrameReceiver, TransportEvent, TransportReceiver, UdpReceiver};
use rumqttc::{Event, EventLoop, Outgoing, Packet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::link::Link;

/// One unit of received traffic
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A complete frame from a TCP peer
    Frame(Bytes),
    /// A UDP datagram and its sender
    Datagram { payload: Bytes, from: SocketAddr },
    /// An MQTT publish on a subscribed topic
    Publish {
        topic: String,
        payload: Bytes,
        qos: u8,
    },
}

impl Inbound {
    pub fn payload(&self) -> &Bytes {
        match self {
            Inbound::Frame(payload)
            | Inbound::Datagram { payload, .. }
            | Inbound::Publish { payload, .. } => payload,
        }
    }

    /// Decode the payload as an envelope: MessagePack for frames and
    /// datagrams, JSON for MQTT publishes
    pub fn envelope(&self) -> portico_core::Result<Envelope> {
        match self {
            Inbound::Publish { payload, .. } => codec::decode_json(payload),
            other => codec::decode(other.payload()),
        }
    }
}

/// Application logic bound to one link
///
/// Errors returned from [`on_message`](Self::on_message) are logged and
/// the loop keeps going; closing the link is the handler's call.
#[async_trait]
pub trait ProtocolHandler: Send + 'static {
    async fn on_open(&mut self, _link: &Link) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_message(&mut self, link: &Link, inbound: Inbound) -> anyhow::Result<()>;

    async fn on_close(&mut self, _link: &Link) {}
}

pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn ProtocolHandler> + Send + Sync>;

/// Handler identity -> factory
#[derive(Default)]
pub struct HandlerCatalog {
    factories: DashMap<String, HandlerFactory>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `identity`
    pub fn register<F, H>(&self, identity: impl Into<String>, factory: F) -> &Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: ProtocolHandler,
    {
        let identity = identity.into();
        debug!("Registered protocol handler {}", identity);
        self.factories.insert(
            identity,
            Arc::new(move || Box::new(factory()) as Box<dyn ProtocolHandler>),
        );
        self
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.factories.contains_key(identity)
    }

    /// Build a fresh handler for `identity`
    pub fn resolve(&self, identity: &str) -> Result<Box<dyn ProtocolHandler>> {
        let factory = self
            .factories
            .get(identity)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::UnknownHandler(identity.to_string()))?;
        Ok(factory())
    }

    /// Fail with the first identity that is not registered
    pub fn check<'a>(&self, identities: impl IntoIterator<Item = &'a str>) -> Result<()> {
        match identities.into_iter().find(|id| !self.contains(id)) {
            Some(unknown) => Err(EngineError::UnknownHandler(unknown.to_string())),
            None => Ok(()),
        }
    }

    /// Registered identities, sorted
    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// Drops datagrams on a UDP endpoint configured without a handler
pub(crate) struct DatagramSink;

#[async_trait]
impl ProtocolHandler for DatagramSink {
    async fn on_message(&mut self, link: &Link, inbound: Inbound) -> anyhow::Result<()> {
        debug!(
            endpoint = %link.endpoint(),
            "Dropping {} byte datagram (no handler)",
            inbound.payload().len()
        );
        Ok(())
    }
}

/// Where a bound handler's traffic comes from
pub(crate) enum Source {
    Stream(FrameReceiver),
    Datagram(UdpReceiver),
    Mqtt(Box<EventLoop>),
    /// Send-only endpoints: nothing ever arrives
    Idle,
}

impl Source {
    /// Next inbound unit, or `None` once the resource is closed
    async fn next(&mut self, endpoint: &str) -> Option<Inbound> {
        match self {
            Source::Stream(receiver) => loop {
                match receiver.recv().await? {
                    TransportEvent::Data(data) => return Some(Inbound::Frame(data)),
                    TransportEvent::Error(e) => warn!(endpoint = %endpoint, "Stream error: {}", e),
                    TransportEvent::Disconnected { reason } => {
                        debug!(endpoint = %endpoint, "Stream disconnected: {:?}", reason);
                        return None;
                    }
                }
            },
            Source::Datagram(receiver) => loop {
                match receiver.recv_from().await? {
                    (TransportEvent::Data(payload), from) => {
                        return Some(Inbound::Datagram { payload, from })
                    }
                    (TransportEvent::Error(e), _) => {
                        warn!(endpoint = %endpoint, "Datagram error: {}", e)
                    }
                    (TransportEvent::Disconnected { .. }, _) => return None,
                }
            },
            Source::Mqtt(eventloop) => loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        return Some(Inbound::Publish {
                            topic: publish.topic,
                            payload: publish.payload,
                            qos: publish.qos as u8,
                        })
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        info!(endpoint = %endpoint, "MQTT broker disconnected");
                        return None;
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return None,
                    Ok(_) => {}
                    Err(e) => {
                        error!(endpoint = %endpoint, "MQTT connection lost: {}", e);
                        return None;
                    }
                }
            },
            Source::Idle => std::future::pending().await,
        }
    }

    fn is_idle(&self) -> bool {
        matches!(self, Source::Idle)
    }
}

/// Progress of a bound handler's loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Running,
    Finished,
}

/// A handler bound to one live link
///
/// The loop is started at most once; rebinding means a fresh runtime.
pub struct BoundHandler {
    identity: String,
    link: Link,
    pending: Mutex<Option<(Box<dyn ProtocolHandler>, Source)>>,
    activity: watch::Sender<Activity>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BoundHandler {
    pub(crate) fn bind(
        identity: &str,
        handler: Box<dyn ProtocolHandler>,
        link: Link,
        source: Source,
    ) -> Self {
        let (activity, _) = watch::channel(Activity::Idle);
        let (shutdown, _) = watch::channel(false);
        Self {
            identity: identity.to_string(),
            link,
            pending: Mutex::new(Some((handler, source))),
            activity,
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Handler identity this was resolved from
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Spawn the receive/dispatch loop. Returns `false` if it was already started.
    pub fn start(&self) -> bool {
        let Some((handler, source)) = self.pending.lock().take() else {
            return false;
        };

        let task = tokio::spawn(dispatch(
            handler,
            self.link.clone(),
            source,
            self.shutdown.subscribe(),
            self.activity.clone(),
        ));
        *self.task.lock() = Some(task);
        true
    }

    pub fn activity(&self) -> Activity {
        *self.activity.borrow()
    }

    /// The loop has begun and not yet ended
    pub fn is_running(&self) -> bool {
        self.activity() == Activity::Running
    }

    pub fn has_started(&self) -> bool {
        self.activity() != Activity::Idle
    }

    pub fn is_finished(&self) -> bool {
        self.activity() == Activity::Finished
            || self.task.lock().as_ref().is_some_and(|t| t.is_finished())
    }

    /// Wait until the loop has begun
    pub async fn wait_running(&self, timeout: Duration) -> Result<()> {
        self.wait_activity(|a| *a != Activity::Idle, timeout).await
    }

    pub async fn wait_finished(&self, timeout: Duration) -> Result<()> {
        self.wait_activity(|a| *a == Activity::Finished, timeout).await
    }

    async fn wait_activity<F>(&self, pred: F, timeout: Duration) -> Result<()>
    where
        F: Fn(&Activity) -> bool,
    {
        let mut rx = self.activity.subscribe();
        let reached = match tokio::time::timeout(timeout, rx.wait_for(|a| pred(a))).await {
            Ok(_) => Ok(()),
            Err(_) => Err(EngineError::Timeout),
        };
        reached
    }

    /// Close the link and wait up to `grace` for the loop to wind down
    pub async fn shutdown(&self, grace: Duration) {
        if self.pending.lock().take().is_some() {
            self.link.close().await;
            self.activity.send_replace(Activity::Finished);
            return;
        }

        self.shutdown.send_replace(true);
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!(
                    endpoint = %self.link.endpoint(),
                    "Handler {} did not stop within {:?}, aborting",
                    self.identity, grace
                );
                task.abort();
                self.activity.send_replace(Activity::Finished);
            }
        }
    }
}

impl std::fmt::Debug for BoundHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundHandler")
            .field("identity", &self.identity)
            .field("link", &self.link)
            .field("activity", &self.activity())
            .finish()
    }
}

/// Resolves once a shutdown was requested; never if the sender is gone
pub(crate) async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    let requested = rx.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

async fn dispatch(
    mut handler: Box<dyn ProtocolHandler>,
    link: Link,
    mut source: Source,
    mut shutdown_rx: watch::Receiver<bool>,
    activity: watch::Sender<Activity>,
) {
    let endpoint = link.endpoint().to_string();
    activity.send_replace(Activity::Running);

    let mut closing = false;
    if let Err(e) = handler.on_open(&link).await {
        warn!(endpoint = %endpoint, "Handler refused link: {:#}", e);
        link.close().await;
        closing = true;
    }

    loop {
        let inbound = if closing {
            if source.is_idle() {
                break;
            }
            source.next(&endpoint).await
        } else {
            tokio::select! {
                _ = wait_shutdown(&mut shutdown_rx) => {
                    link.close().await;
                    closing = true;
                    continue;
                }
                inbound = source.next(&endpoint) => inbound,
            }
        };

        match inbound {
            Some(inbound) => {
                if let Err(e) = handler.on_message(&link, inbound).await {
                    warn!(endpoint = %endpoint, "Handler error: {:#}", e);
                }
            }
            None => break,
        }
    }

    handler.on_close(&link).await;
    debug!(endpoint = %endpoint, "Handler loop finished");
    activity.send_replace(Activity::Finished);
}

//! MQTT instance runtime
//!
//! `init` connects, waits for the broker's CONNACK within the connect
//! timeout and queues the configured subscriptions. Publishes then flow
//! to the topic handler. A lost broker connection ends the handler loop;
//! reconnecting is the caller's decision.

use async_trait::async_trait;
use portico_core::{LifecycleState, StateCell};
use portico_transport::MqttTlsMaterial;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, SubscribeFilter,
    TlsConfiguration, Transport,
};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{transition, Endpoint, EndpointKind, SHUTDOWN_GRACE};
use crate::config::MqttInfos;
use crate::error::{EngineError, Result};
use crate::handler::{BoundHandler, HandlerCatalog, Source};
use crate::link::{qos, Link};

/// Request channel capacity between client handle and event loop
const REQUEST_CAPACITY: usize = 64;

pub struct MqttRuntime {
    id: String,
    infos: MqttInfos,
    catalog: Arc<HandlerCatalog>,
    state: StateCell,
    lifecycle: Mutex<()>,
    handler: OnceLock<Arc<BoundHandler>>,
}

impl MqttRuntime {
    pub fn new(id: impl Into<String>, infos: MqttInfos, catalog: Arc<HandlerCatalog>) -> Self {
        Self {
            id: id.into(),
            infos,
            catalog,
            state: StateCell::new(),
            lifecycle: Mutex::new(()),
            handler: OnceLock::new(),
        }
    }

    pub fn infos(&self) -> &MqttInfos {
        &self.infos
    }

    pub fn state_cell(&self) -> &StateCell {
        &self.state
    }

    pub fn handler(&self) -> Option<Arc<BoundHandler>> {
        self.handler.get().cloned()
    }

    /// Publish/subscribe handle, once connected
    pub fn link(&self) -> Option<Link> {
        self.handler.get().map(|h| h.link().clone())
    }

    fn options(&self) -> Result<MqttOptions> {
        let mut options = MqttOptions::new(
            self.infos.client_id.clone(),
            self.infos.broker_ip.clone(),
            self.infos.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(self.infos.keep_alive_secs as u64));

        if let (Some(user), Some(pass)) = (&self.infos.username, &self.infos.password) {
            options.set_credentials(user, pass);
        }

        if self.infos.is_tls_enabled() {
            let material = MqttTlsMaterial::load(&self.infos.tls_files())?;
            debug!(endpoint = %self.id, "MQTT TLS material loaded: {:?}", material);
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: material.ca,
                alpn: None,
                client_auth: material.client_auth,
            }));
        }

        Ok(options)
    }

    async fn connect(&self, eventloop: &mut EventLoop) -> Result<()> {
        let connack = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return match ack.code {
                            ConnectReturnCode::Success => Ok(()),
                            code => Err(EngineError::Mqtt(format!(
                                "broker refused connection: {:?}",
                                code
                            ))),
                        };
                    }
                    Ok(other) => debug!(endpoint = %self.id, "MQTT event before CONNACK: {:?}", other),
                    Err(e) => return Err(EngineError::from(e)),
                }
            }
        };

        tokio::time::timeout(self.infos.connect_timeout(), connack)
            .await
            .map_err(|_| EngineError::Timeout)?
    }

    async fn init_locked(&self) -> LifecycleState {
        if self.state.get() != LifecycleState::Down {
            return self.state.get();
        }

        match self.acquire().await {
            Ok(bound) => {
                info!(
                    endpoint = %self.id,
                    "MQTT connected to {}:{} as {}",
                    self.infos.broker_ip, self.infos.broker_port, self.infos.client_id
                );
                let _ = self.handler.set(Arc::new(bound));
                transition(&self.id, &self.state, LifecycleState::Ready)
            }
            Err(e) => {
                error!(
                    endpoint = %self.id,
                    "MQTT connection to {}:{} failed: {}",
                    self.infos.broker_ip, self.infos.broker_port, e
                );
                transition(&self.id, &self.state, LifecycleState::Broken)
            }
        }
    }

    async fn acquire(&self) -> Result<BoundHandler> {
        self.infos.validate()?;
        let handler = self.catalog.resolve(&self.infos.topic_handler)?;
        let options = self.options()?;

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        self.connect(&mut eventloop).await?;

        if !self.infos.subscriptions.is_empty() {
            let filters: Vec<SubscribeFilter> = self
                .infos
                .subscriptions
                .iter()
                .map(|s| SubscribeFilter::new(s.topic.clone(), qos(self.infos.qos_for(s))))
                .collect();
            client.subscribe_many(filters).await?;
            for s in &self.infos.subscriptions {
                debug!(endpoint = %self.id, "MQTT subscribing to {} (qos {})", s.topic, self.infos.qos_for(s));
            }
        }

        let link = Link::mqtt(
            &self.id,
            client,
            self.infos.default_qos,
            vec![self.infos.topic_handler.clone()],
        );
        Ok(BoundHandler::bind(
            &self.infos.topic_handler,
            handler,
            link,
            Source::Mqtt(Box::new(eventloop)),
        ))
    }
}

#[async_trait]
impl Endpoint for MqttRuntime {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Mqtt
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
                error!(endpoint = %self.id, "MQTT instance is {}, handler not started", other);
                other
            }
        }
    }

    async fn shutdown(&self) {
        if let Some(handler) = self.handler.get() {
            handler.shutdown(SHUTDOWN_GRACE).await;
            info!(endpoint = %self.id, "MQTT instance stopped");
        }
    }
}

impl std::fmt::Debug for MqttRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttRuntime")
            .field("id", &self.id)
            .field("client_id", &self.infos.client_id)
            .field("state", &self.state.get())
            .finish()
    }
}

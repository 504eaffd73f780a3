//! Endpoint registry
//!
//! Stores configuration records by identifier (one namespace per endpoint
//! kind), launches runtimes on demand and keeps every launched runtime for
//! supervision and shutdown.
//!
//! Expected failures never surface as errors here: an unknown id or a bad
//! record is logged and the launch yields `None`; a runtime that cannot
//! acquire its resource is returned in the `BROKEN` state.
//!
//! # Example
//!
//! ```no_run
//! use portico_engine::{builtin, EndpointRegistry, MqttInfos, ServerInfos};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let registry = EndpointRegistry::new(Arc::new(builtin::catalog()));
//! registry
//!     .register_server("lobby", ServerInfos::new("0.0.0.0", 7000, vec!["echo".into()]))
//!     .register_mqtt("telemetry", MqttInfos::new("broker.local", "log"));
//!
//! let report = registry.launch_all().await;
//! println!("{}", report);
//! # }
//! ```

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::{ClientInfos, EndpointsConfig, MqttInfos, ServerInfos, UdpInfos};
use crate::error::Result;
use crate::handler::HandlerCatalog;
use crate::runtime::{
    ClientRuntime, Endpoint, EndpointKind, MqttRuntime, ServerRuntime, UdpRuntime,
};

/// Outcome of [`EndpointRegistry::launch_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchReport {
    /// Launched and running, as `kind:id`
    pub running: Vec<String>,
    /// Launched but `BROKEN`
    pub broken: Vec<String>,
    /// Not launched: the record failed validation or handler resolution
    pub rejected: Vec<String>,
}

impl LaunchReport {
    pub fn launched(&self) -> usize {
        self.running.len() + self.broken.len()
    }

    pub fn is_clean(&self) -> bool {
        self.broken.is_empty() && self.rejected.is_empty()
    }

    fn record(&mut self, kind: EndpointKind, id: &str, endpoint: Option<&dyn Endpoint>) {
        let label = format!("{}:{}", kind, id);
        match endpoint {
            Some(e) if e.is_broken() => self.broken.push(label),
            Some(_) => self.running.push(label),
            None => self.rejected.push(label),
        }
    }
}

impl fmt::Display for LaunchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} running, {} broken, {} rejected",
            self.running.len(),
            self.broken.len(),
            self.rejected.len()
        )
    }
}

/// Records and live runtimes for every endpoint kind
pub struct EndpointRegistry {
    catalog: Arc<HandlerCatalog>,

    server_infos: DashMap<String, ServerInfos>,
    client_infos: DashMap<String, ClientInfos>,
    udp_infos: DashMap<String, UdpInfos>,
    mqtt_infos: DashMap<String, MqttInfos>,

    servers: RwLock<Vec<Arc<ServerRuntime>>>,
    clients: RwLock<Vec<Arc<ClientRuntime>>>,
    udp_handlers: RwLock<Vec<Arc<UdpRuntime>>>,
    mqtt_instances: RwLock<Vec<Arc<MqttRuntime>>>,
}

impl EndpointRegistry {
    pub fn new(catalog: Arc<HandlerCatalog>) -> Self {
        Self {
            catalog,
            server_infos: DashMap::new(),
            client_infos: DashMap::new(),
            udp_infos: DashMap::new(),
            mqtt_infos: DashMap::new(),
            servers: RwLock::new(Vec::new()),
            clients: RwLock::new(Vec::new()),
            udp_handlers: RwLock::new(Vec::new()),
            mqtt_instances: RwLock::new(Vec::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<HandlerCatalog> {
        &self.catalog
    }

    // Registration

    pub fn register_server(&self, id: impl Into<String>, infos: ServerInfos) -> &Self {
        let id = id.into();
        info!(endpoint = %id, "Registered server {}:{} {:?}", infos.host, infos.port, infos.protocols);
        self.server_infos.insert(id, infos);
        self
    }

    pub fn register_client(&self, id: impl Into<String>, infos: ClientInfos) -> &Self {
        let id = id.into();
        info!(
            endpoint = %id,
            "Registered client {}:{} ({}{})",
            infos.host,
            infos.port,
            infos.protocol,
            if infos.is_tls_enabled() { ", TLS" } else { "" }
        );
        self.client_infos.insert(id, infos);
        self
    }

    pub fn register_udp_handler(&self, id: impl Into<String>, infos: UdpInfos) -> &Self {
        let id = id.into();
        info!(
            endpoint = %id,
            "Registered UDP handler {}:{} (bind={})",
            infos.host, infos.port, infos.bind
        );
        self.udp_infos.insert(id, infos);
        self
    }

    pub fn register_mqtt(&self, id: impl Into<String>, infos: MqttInfos) -> &Self {
        let id = id.into();
        info!(
            endpoint = %id,
            "Registered MQTT instance {}:{} as {}",
            infos.broker_ip, infos.broker_port, infos.client_id
        );
        self.mqtt_infos.insert(id, infos);
        self
    }

    /// Register every record of a loaded file.
    ///
    /// Nothing is registered unless every handler identity in the file is
    /// known to the catalog.
    pub fn register_config(&self, config: EndpointsConfig) -> Result<&Self> {
        config.validate()?;
        let identities = config.handler_identities();
        self.catalog.check(identities.iter().map(String::as_str))?;

        for (id, infos) in config.servers {
            self.register_server(id, infos);
        }
        for (id, infos) in config.clients {
            self.register_client(id, infos);
        }
        for (id, infos) in config.udp_handlers {
            self.register_udp_handler(id, infos);
        }
        for (id, infos) in config.mqtt {
            self.register_mqtt(id, infos);
        }
        Ok(self)
    }

    pub fn server_infos(&self, id: &str) -> Option<ServerInfos> {
        self.server_infos.get(id).map(|r| r.value().clone())
    }

    pub fn client_infos(&self, id: &str) -> Option<ClientInfos> {
        self.client_infos.get(id).map(|r| r.value().clone())
    }

    pub fn udp_infos(&self, id: &str) -> Option<UdpInfos> {
        self.udp_infos.get(id).map(|r| r.value().clone())
    }

    pub fn mqtt_infos(&self, id: &str) -> Option<MqttInfos> {
        self.mqtt_infos.get(id).map(|r| r.value().clone())
    }

    // Launch

    pub async fn launch_server(&self, id: &str) -> Option<Arc<ServerRuntime>> {
        let infos = self.lookup(EndpointKind::Server, id, &self.server_infos)?;
        let checked = infos.validate().and_then(|_| {
            self.catalog
                .check(infos.protocols.iter().map(String::as_str))
        });
        self.accept(EndpointKind::Server, id, checked)?;

        let runtime = Arc::new(ServerRuntime::new(id, infos, self.catalog.clone()));
        runtime.run().await;
        self.servers.write().push(runtime.clone());
        Some(runtime)
    }

    pub async fn launch_client(&self, id: &str) -> Option<Arc<ClientRuntime>> {
        let infos = self.lookup(EndpointKind::Client, id, &self.client_infos)?;
        let checked = infos
            .validate()
            .and_then(|_| self.catalog.check([infos.protocol.as_str()]));
        self.accept(EndpointKind::Client, id, checked)?;

        let runtime = Arc::new(ClientRuntime::new(id, infos, self.catalog.clone()));
        runtime.run().await;
        self.clients.write().push(runtime.clone());
        Some(runtime)
    }

    pub async fn launch_udp_handler(&self, id: &str) -> Option<Arc<UdpRuntime>> {
        let infos = self.lookup(EndpointKind::Udp, id, &self.udp_infos)?;
        let checked = infos
            .validate()
            .and_then(|_| self.catalog.check(infos.handler.as_deref()));
        self.accept(EndpointKind::Udp, id, checked)?;

        let runtime = Arc::new(UdpRuntime::new(id, infos, self.catalog.clone()));
        runtime.run().await;
        self.udp_handlers.write().push(runtime.clone());
        Some(runtime)
    }

    pub async fn launch_mqtt(&self, id: &str) -> Option<Arc<MqttRuntime>> {
        let infos = self.lookup(EndpointKind::Mqtt, id, &self.mqtt_infos)?;
        let checked = infos
            .validate()
            .and_then(|_| self.catalog.check([infos.topic_handler.as_str()]));
        self.accept(EndpointKind::Mqtt, id, checked)?;

        let runtime = Arc::new(MqttRuntime::new(id, infos, self.catalog.clone()));
        runtime.run().await;
        self.mqtt_instances.write().push(runtime.clone());
        Some(runtime)
    }

    /// Launch every registered record, each kind concurrently
    pub async fn launch_all(&self) -> LaunchReport {
        let mut report = LaunchReport::default();

        let ids = sorted_keys(&self.server_infos);
        let launched = join_all(ids.iter().map(|id| self.launch_server(id))).await;
        for (id, runtime) in ids.iter().zip(launched) {
            report.record(EndpointKind::Server, id, runtime.as_deref().map(|r| r as &dyn Endpoint));
        }

        let ids = sorted_keys(&self.client_infos);
        let launched = join_all(ids.iter().map(|id| self.launch_client(id))).await;
        for (id, runtime) in ids.iter().zip(launched) {
            report.record(EndpointKind::Client, id, runtime.as_deref().map(|r| r as &dyn Endpoint));
        }

        let ids = sorted_keys(&self.udp_infos);
        let launched = join_all(ids.iter().map(|id| self.launch_udp_handler(id))).await;
        for (id, runtime) in ids.iter().zip(launched) {
            report.record(EndpointKind::Udp, id, runtime.as_deref().map(|r| r as &dyn Endpoint));
        }

        let ids = sorted_keys(&self.mqtt_infos);
        let launched = join_all(ids.iter().map(|id| self.launch_mqtt(id))).await;
        for (id, runtime) in ids.iter().zip(launched) {
            report.record(EndpointKind::Mqtt, id, runtime.as_deref().map(|r| r as &dyn Endpoint));
        }

        info!("Launch complete: {}", report);
        report
    }

    fn lookup<T: Clone>(&self, kind: EndpointKind, id: &str, records: &DashMap<String, T>) -> Option<T> {
        let found = records.get(id).map(|r| r.value().clone());
        if found.is_none() {
            error!(endpoint = %id, "No {} registered under this id", kind);
        }
        found
    }

    fn accept(&self, kind: EndpointKind, id: &str, checked: Result<()>) -> Option<()> {
        match checked {
            Ok(()) => Some(()),
            Err(e) => {
                error!(endpoint = %id, "Refusing to launch {}: {}", kind, e);
                None
            }
        }
    }

    // Supervision

    pub fn servers(&self) -> Vec<Arc<ServerRuntime>> {
        self.servers.read().clone()
    }

    pub fn clients(&self) -> Vec<Arc<ClientRuntime>> {
        self.clients.read().clone()
    }

    pub fn udp_handlers(&self) -> Vec<Arc<UdpRuntime>> {
        self.udp_handlers.read().clone()
    }

    pub fn mqtt_instances(&self) -> Vec<Arc<MqttRuntime>> {
        self.mqtt_instances.read().clone()
    }

    /// Every live runtime, regardless of kind
    pub fn endpoints(&self) -> Vec<Arc<dyn Endpoint>> {
        let mut all: Vec<Arc<dyn Endpoint>> = Vec::new();
        all.extend(self.servers().into_iter().map(|r| r as Arc<dyn Endpoint>));
        all.extend(self.clients().into_iter().map(|r| r as Arc<dyn Endpoint>));
        all.extend(self.udp_handlers().into_iter().map(|r| r as Arc<dyn Endpoint>));
        all.extend(self.mqtt_instances().into_iter().map(|r| r as Arc<dyn Endpoint>));
        all
    }

    /// True iff at least one launched runtime is `BROKEN`
    pub fn is_broken(&self) -> bool {
        self.endpoints().iter().any(|e| e.is_broken())
    }

    /// `kind:id` of every broken runtime
    pub fn broken(&self) -> Vec<String> {
        self.endpoints()
            .iter()
            .filter(|e| e.is_broken())
            .map(|e| format!("{}:{}", e.kind(), e.id()))
            .collect()
    }

    /// Stop every live runtime and forget it
    pub async fn shutdown_all(&self) {
        let servers = std::mem::take(&mut *self.servers.write());
        let clients = std::mem::take(&mut *self.clients.write());
        let udp_handlers = std::mem::take(&mut *self.udp_handlers.write());
        let mqtt_instances = std::mem::take(&mut *self.mqtt_instances.write());

        let mut taken: Vec<Arc<dyn Endpoint>> = Vec::new();
        taken.extend(servers.into_iter().map(|r| r as Arc<dyn Endpoint>));
        taken.extend(clients.into_iter().map(|r| r as Arc<dyn Endpoint>));
        taken.extend(udp_handlers.into_iter().map(|r| r as Arc<dyn Endpoint>));
        taken.extend(mqtt_instances.into_iter().map(|r| r as Arc<dyn Endpoint>));

        info!("Shutting down {} endpoints", taken.len());
        join_all(taken.iter().map(|e| e.shutdown())).await;
    }
}

fn sorted_keys<T>(records: &DashMap<String, T>) -> Vec<String> {
    let mut ids: Vec<String> = records.iter().map(|r| r.key().clone()).collect();
    ids.sort();
    ids
}

impl fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("servers", &self.server_infos.len())
            .field("clients", &self.client_infos.len())
            .field("udp_handlers", &self.udp_infos.len())
            .field("mqtt", &self.mqtt_infos.len())
            .field("handlers", &self.catalog.identities())
            .finish()
    }
}

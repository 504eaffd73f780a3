//! Endpoint configuration records and the TOML loader
//!
//! One immutable record type per endpoint kind. Absent keys fall back to
//! the defaults below; a record that names a handler must name one the
//! [`HandlerCatalog`](crate::HandlerCatalog) knows by the time it is launched.
//!
//! ```toml
//! [servers.lobby]
//! port = 7000
//! protocols = ["echo", "log"]
//!
//! [clients.upstream]
//! host = "10.0.0.4"
//! port = 7000
//! protocol = "echo"
//! tls = { ca-file = "ca.pem" }
//!
//! [udp-handlers.beacon]
//! bind = true
//! port = 7001
//!
//! [mqtt.telemetry]
//! broker-ip = "broker.local"
//! topic-handler = "log"
//! subscriptions = [{ topic = "sensors/#" }, { topic = "alarms/#", qos = 1 }]
//! ```

use portico_core::{
    DEFAULT_BACKLOG, DEFAULT_HOST, DEFAULT_MQTT_CLIENT_ID, DEFAULT_MQTT_PORT, DEFAULT_PORT,
};
use portico_transport::TlsFiles;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EngineError, Result};

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_backlog() -> u32 {
    DEFAULT_BACKLOG
}

fn default_broker_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_client_id() -> String {
    DEFAULT_MQTT_CLIENT_ID.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_keep_alive() -> u16 {
    60
}

/// Largest UDP payload an IPv4 datagram can carry
pub const MAX_UDP_PAYLOAD: usize = 65507;

fn default_max_packet_size() -> usize {
    MAX_UDP_PAYLOAD
}

/// TCP server record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerInfos {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Acceptable protocol handlers, in preference order
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub tls: Option<ServerTls>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Certificate and key presented on accepted connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerTls {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl ServerInfos {
    pub fn new(host: impl Into<String>, port: u16, protocols: Vec<String>) -> Self {
        Self {
            host: host.into(),
            port,
            backlog: DEFAULT_BACKLOG,
            protocols,
            tls: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_tls(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        self.tls = Some(ServerTls {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        });
        self
    }

    /// Handler assigned to accepted connections
    pub fn primary_protocol(&self) -> Option<&str> {
        self.protocols.first().map(String::as_str)
    }

    /// Bound on the per-connection TLS handshake
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.protocols.is_empty() {
            return Err(EngineError::Config("server offers no protocols".to_string()));
        }
        Ok(())
    }
}

/// TCP client record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientInfos {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub protocol: String,
    /// Presence enables TLS
    #[serde(default)]
    pub tls: Option<ClientTls>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Trust and identity material for outbound TLS
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientTls {
    /// Trust anchors; absent means the platform trust store
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Name to verify instead of `host`
    #[serde(default)]
    pub server_name: Option<String>,
}

impl ClientTls {
    pub fn files(&self) -> TlsFiles {
        TlsFiles {
            ca_file: self.ca_file.clone(),
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
        }
    }
}

impl ClientInfos {
    pub fn new(host: impl Into<String>, port: u16, protocol: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: protocol.into(),
            tls: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    pub fn with_tls(mut self, tls: ClientTls) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.protocol.trim().is_empty() {
            return Err(EngineError::Config("client has no protocol".to_string()));
        }
        Ok(())
    }
}

/// UDP handler record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UdpInfos {
    /// Bind host:port and receive; otherwise send-only towards host:port
    #[serde(default)]
    pub bind: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Handler for received datagrams; absent means log-and-drop
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

impl Default for UdpInfos {
    fn default() -> Self {
        Self {
            bind: false,
            host: default_host(),
            port: default_port(),
            handler: None,
            max_packet_size: default_max_packet_size(),
        }
    }
}

impl UdpInfos {
    /// Receiving socket bound to `host:port`
    pub fn bound(host: impl Into<String>, port: u16) -> Self {
        Self {
            bind: true,
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Send-only socket targeting `host:port`
    pub fn sender(host: impl Into<String>, port: u16) -> Self {
        Self {
            bind: false,
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_packet_size == 0 || self.max_packet_size > MAX_UDP_PAYLOAD {
            return Err(EngineError::Config(format!(
                "max-packet-size {} is outside 1..={}",
                self.max_packet_size, MAX_UDP_PAYLOAD
            )));
        }
        Ok(())
    }
}

/// One MQTT subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub topic: String,
    /// Overrides the instance default QoS
    #[serde(default)]
    pub qos: Option<u8>,
}

/// MQTT instance record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MqttInfos {
    #[serde(default = "default_host")]
    pub broker_ip: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub default_qos: u8,
    pub topic_handler: String,
    #[serde(default)]
    pub tls_cafile: Option<PathBuf>,
    #[serde(default)]
    pub tls_certfile: Option<PathBuf>,
    #[serde(default)]
    pub tls_keyfile: Option<PathBuf>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl MqttInfos {
    pub fn new(broker_ip: impl Into<String>, topic_handler: impl Into<String>) -> Self {
        Self {
            broker_ip: broker_ip.into(),
            broker_port: DEFAULT_MQTT_PORT,
            client_id: default_client_id(),
            default_qos: 0,
            topic_handler: topic_handler.into(),
            tls_cafile: None,
            tls_certfile: None,
            tls_keyfile: None,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_ms: default_connect_timeout_ms(),
            subscriptions: Vec::new(),
            username: None,
            password: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.broker_port = port;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn subscribe(mut self, topic: impl Into<String>, qos: Option<u8>) -> Self {
        self.subscriptions.push(Subscription {
            topic: topic.into(),
            qos,
        });
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// TLS is on when a CA file is configured
    pub fn is_tls_enabled(&self) -> bool {
        self.tls_cafile.is_some()
    }

    pub fn tls_files(&self) -> TlsFiles {
        TlsFiles {
            ca_file: self.tls_cafile.clone(),
            cert_file: self.tls_certfile.clone(),
            key_file: self.tls_keyfile.clone(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// QoS for a subscription, falling back to the instance default
    pub fn qos_for(&self, subscription: &Subscription) -> u8 {
        subscription.qos.unwrap_or(self.default_qos)
    }

    pub fn validate(&self) -> Result<()> {
        if self.topic_handler.trim().is_empty() {
            return Err(EngineError::Config("mqtt instance has no topic handler".to_string()));
        }
        if self.default_qos > 2 {
            return Err(EngineError::Config(format!(
                "default-qos must be 0, 1 or 2 (got {})",
                self.default_qos
            )));
        }
        if let Some(bad) = self.subscriptions.iter().find(|s| s.qos.is_some_and(|q| q > 2)) {
            return Err(EngineError::Config(format!(
                "subscription {} has qos above 2",
                bad.topic
            )));
        }
        if self.keep_alive_secs != 0 && self.keep_alive_secs < 5 {
            return Err(EngineError::Config(format!(
                "keep-alive-secs must be 0 or at least 5 (got {})",
                self.keep_alive_secs
            )));
        }
        if self.tls_certfile.is_some() != self.tls_keyfile.is_some() {
            return Err(EngineError::Config(
                "tls-certfile and tls-keyfile must be given together".to_string(),
            ));
        }
        if self.tls_certfile.is_some() && self.tls_cafile.is_none() {
            return Err(EngineError::Config(
                "tls-certfile requires tls-cafile".to_string(),
            ));
        }
        Ok(())
    }
}

/// Every endpoint record of one configuration file, keyed by identifier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EndpointsConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerInfos>,
    #[serde(default)]
    pub clients: BTreeMap<String, ClientInfos>,
    #[serde(default, alias = "udpHandlers")]
    pub udp_handlers: BTreeMap<String, UdpInfos>,
    #[serde(default)]
    pub mqtt: BTreeMap<String, MqttInfos>,
}

impl EndpointsConfig {
    /// Parse and validate TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EndpointsConfig =
            toml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Structural checks that need no handler catalog
    pub fn validate(&self) -> Result<()> {
        let labelled = |kind: &str, id: &str, e: EngineError| match e {
            EngineError::Config(msg) => EngineError::Config(format!("{} '{}': {}", kind, id, msg)),
            other => other,
        };
        for (id, infos) in &self.servers {
            infos.validate().map_err(|e| labelled("server", id, e))?;
        }
        for (id, infos) in &self.clients {
            infos.validate().map_err(|e| labelled("client", id, e))?;
        }
        for (id, infos) in &self.udp_handlers {
            infos.validate().map_err(|e| labelled("udp", id, e))?;
        }
        for (id, infos) in &self.mqtt {
            infos.validate().map_err(|e| labelled("mqtt", id, e))?;
        }
        Ok(())
    }

    /// Every handler identity named anywhere in the file
    pub fn handler_identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        ids.extend(self.servers.values().flat_map(|s| s.protocols.iter().cloned()));
        ids.extend(self.clients.values().map(|c| c.protocol.clone()));
        ids.extend(self.udp_handlers.values().filter_map(|u| u.handler.clone()));
        ids.extend(self.mqtt.values().map(|m| m.topic_handler.clone()));
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
            && self.clients.is_empty()
            && self.udp_handlers.is_empty()
            && self.mqtt.is_empty()
    }
}

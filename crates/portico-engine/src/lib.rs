//! Portico Engine
//!
//! The endpoint registry and lifecycle engine:
//! - Typed configuration records per endpoint kind ([`config`])
//! - The protocol handler contract and its factory catalog ([`handler`])
//! - One runtime per endpoint kind: TCP server, TCP client, UDP, MQTT ([`runtime`])
//! - The [`EndpointRegistry`] that stores records and launches runtimes
//!
//! # Example
//!
//! ```no_run
//! use portico_engine::{builtin, ClientInfos, Endpoint, EndpointRegistry, LifecycleState};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let catalog = Arc::new(builtin::catalog());
//! let registry = EndpointRegistry::new(catalog);
//!
//! registry.register_client("upstream", ClientInfos::new("127.0.0.1", 9999, "echo"));
//!
//! if let Some(client) = registry.launch_client("upstream").await {
//!     if client.state() == LifecycleState::Broken {
//!         eprintln!("upstream is unreachable");
//!     }
//! }
//! # }
//! ```

pub mod builtin;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod link;
pub mod registry;
pub mod runtime;

pub use config::{
    ClientInfos, ClientTls, EndpointsConfig, MqttInfos, ServerInfos, ServerTls, Subscription,
    UdpInfos,
};
pub use dispatch::EnvelopeDispatch;
pub use error::{EngineError, Result};
pub use handler::{Activity, BoundHandler, HandlerCatalog, HandlerFactory, Inbound, ProtocolHandler};
pub use link::Link;
pub use registry::{EndpointRegistry, LaunchReport};
pub use runtime::{
    ClientRuntime, Endpoint, EndpointKind, MqttRuntime, ServerRuntime, Session, UdpRuntime,
};

pub use portico_core::{Envelope, LifecycleState, Outcome, Value};

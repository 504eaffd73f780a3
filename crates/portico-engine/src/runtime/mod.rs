//! Endpoint runtimes
//!
//! One runtime per launch. Each owns its network resource, its
//! [`StateCell`] and, once bound, its handler. Runtimes never share
//! mutable state with each other.

mod client;
mod mqtt;
mod server;
mod udp;

pub use client::ClientRuntime;
pub use mqtt::MqttRuntime;
pub use server::{ServerRuntime, Session};
pub use udp::UdpRuntime;

use async_trait::async_trait;
use portico_core::{LifecycleState, StateCell};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// How long `shutdown` waits for a handler loop before aborting it
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Server,
    Client,
    Udp,
    Mqtt,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EndpointKind::Server => "server",
            EndpointKind::Client => "client",
            EndpointKind::Udp => "udp",
            EndpointKind::Mqtt => "mqtt",
        })
    }
}

/// Capabilities shared by every runtime
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> EndpointKind;

    fn state(&self) -> LifecycleState;

    /// Acquire the resource and bind the handler. No-op unless `DOWN`.
    async fn init(&self) -> LifecycleState;

    /// `init` if needed, then start serving. Idempotent.
    async fn run(&self) -> LifecycleState;

    /// Release the resource and stop the handler
    async fn shutdown(&self);

    fn is_broken(&self) -> bool {
        self.state() == LifecycleState::Broken
    }
}

/// Apply `to`, logging rejected transitions, and return the resulting state
pub(crate) fn transition(id: &str, state: &StateCell, to: LifecycleState) -> LifecycleState {
    match state.advance(to) {
        Ok(from) => debug!(endpoint = %id, "{} -> {}", from, to),
        Err(e) => warn!(endpoint = %id, "{}", e),
    }
    state.get()
}

//! Envelope dispatch by type
//!
//! A ready-made [`ProtocolHandler`] for links that carry [`Envelope`]s.
//! Routes are keyed by the lower-cased envelope type; a route may return
//! a reply, which goes back the way the request came.

use async_trait::async_trait;
use portico_core::{codec, Envelope};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::handler::{Inbound, ProtocolHandler};
use crate::link::Link;

pub type Route = Arc<dyn Fn(&Envelope) -> Option<Envelope> + Send + Sync>;

#[derive(Clone, Default)]
pub struct EnvelopeDispatch {
    routes: HashMap<String, Route>,
    fallback: Option<Route>,
}

impl EnvelopeDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route envelopes of type `kind` (case-insensitive)
    pub fn on<F>(mut self, kind: &str, route: F) -> Self
    where
        F: Fn(&Envelope) -> Option<Envelope> + Send + Sync + 'static,
    {
        self.routes.insert(kind.to_lowercase(), Arc::new(route));
        self
    }

    /// Route for types with no explicit route
    pub fn fallback<F>(mut self, route: F) -> Self
    where
        F: Fn(&Envelope) -> Option<Envelope> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(route));
        self
    }

    /// Apply the matching route, if any
    pub fn route(&self, envelope: &Envelope) -> Option<Envelope> {
        match self.routes.get(envelope.kind()).or(self.fallback.as_ref()) {
            Some(route) => route(envelope),
            None => {
                debug!("No route for {}", envelope);
                None
            }
        }
    }
}

#[async_trait]
impl ProtocolHandler for EnvelopeDispatch {
    async fn on_message(&mut self, link: &Link, inbound: Inbound) -> anyhow::Result<()> {
        let envelope = inbound.envelope()?;
        let Some(reply) = self.route(&envelope) else {
            return Ok(());
        };

        match inbound {
            Inbound::Frame(_) => link.send_envelope(&reply).await?,
            Inbound::Datagram { from, .. } => link.send_to(codec::encode(&reply)?, from).await?,
            Inbound::Publish { topic, .. } => {
                link.publish_envelope(&format!("{}/reply", topic), &reply)
                    .await?
            }
        }
        Ok(())
    }
}

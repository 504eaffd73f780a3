//! Built-in demo handlers
//!
//! - `echo`: sends every frame/datagram back where it came from
//! - `log`: logs traffic and otherwise ignores it
//! - `envelope-ping`: answers `ping` envelopes with `ping_success`

use async_trait::async_trait;
use portico_core::Outcome;
use tracing::{debug, info};

use crate::dispatch::EnvelopeDispatch;
use crate::handler::{HandlerCatalog, Inbound, ProtocolHandler};
use crate::link::Link;

pub const ECHO: &str = "echo";
pub const LOG: &str = "log";
pub const ENVELOPE_PING: &str = "envelope-ping";

pub struct Echo;

#[async_trait]
impl ProtocolHandler for Echo {
    async fn on_message(&mut self, link: &Link, inbound: Inbound) -> anyhow::Result<()> {
        match inbound {
            Inbound::Frame(data) => link.send(data).await?,
            Inbound::Datagram { payload, from } => link.send_to(payload, from).await?,
            Inbound::Publish { topic, .. } => {
                debug!(endpoint = %link.endpoint(), "Not echoing publish on {}", topic)
            }
        }
        Ok(())
    }
}

pub struct Log;

#[async_trait]
impl ProtocolHandler for Log {
    async fn on_open(&mut self, link: &Link) -> anyhow::Result<()> {
        info!(endpoint = %link.endpoint(), "{} link open (peer {:?})", link.kind(), link.peer());
        Ok(())
    }

    async fn on_message(&mut self, link: &Link, inbound: Inbound) -> anyhow::Result<()> {
        let rendered = inbound
            .envelope()
            .map(|q| q.to_string())
            .unwrap_or_else(|_| format!("{} raw bytes", inbound.payload().len()));

        match &inbound {
            Inbound::Frame(_) => info!(endpoint = %link.endpoint(), "frame: {}", rendered),
            Inbound::Datagram { from, .. } => {
                info!(endpoint = %link.endpoint(), "datagram from {}: {}", from, rendered)
            }
            Inbound::Publish { topic, .. } => {
                info!(endpoint = %link.endpoint(), "publish on {}: {}", topic, rendered)
            }
        }
        Ok(())
    }

    async fn on_close(&mut self, link: &Link) {
        info!(endpoint = %link.endpoint(), "{} link closed", link.kind());
    }
}

pub fn envelope_ping() -> EnvelopeDispatch {
    EnvelopeDispatch::new().on("ping", |_| Some(Outcome::Success.reply("ping")))
}

/// Register the built-in handlers into `catalog`
pub fn register(catalog: &HandlerCatalog) {
    let ping = envelope_ping();
    catalog
        .register(ECHO, || Echo)
        .register(LOG, || Log)
        .register(ENVELOPE_PING, move || ping.clone());
}

/// A catalog holding only the built-in handlers
pub fn catalog() -> HandlerCatalog {
    let catalog = HandlerCatalog::new();
    register(&catalog);
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        assert_eq!(catalog().identities(), vec![ECHO, ENVELOPE_PING, LOG]);
    }
}

//! Portico Core
//!
//! Primitives shared by every portico endpoint:
//! - The message envelope exchanged with protocol handlers ([`Envelope`], [`Value`])
//! - A lightweight outcome signal ([`Outcome`])
//! - The endpoint lifecycle state machine ([`LifecycleState`], [`StateCell`])
//! - MessagePack encoding of envelopes ([`codec`])

pub mod codec;
pub mod envelope;
pub mod error;
pub mod state;

pub use codec::{decode, encode};
pub use envelope::{Category, Envelope, Outcome, Value};
pub use error::{Error, Result};
pub use state::{LifecycleState, StateCell};

/// Default host used by every endpoint record
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default TCP/UDP port
pub const DEFAULT_PORT: u16 = 50000;

/// Default listen backlog for TCP servers
pub const DEFAULT_BACKLOG: u32 = 10;

/// Default MQTT broker port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Default MQTT client identifier
pub const DEFAULT_MQTT_CLIENT_ID: &str = "portico-mqtt";

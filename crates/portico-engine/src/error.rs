//! Engine error types

use portico_core::LifecycleState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown protocol handler: {0}")]
    UnknownHandler(String),

    #[error("endpoint is {0}")]
    NotReady(LifecycleState),

    #[error("operation not supported on {link} link: {op}")]
    Unsupported { link: &'static str, op: &'static str },

    #[error("mqtt error: {0}")]
    Mqtt(String),

    #[error("timeout")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[from] portico_transport::TransportError),

    #[error("core error: {0}")]
    Core(#[from] portico_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rumqttc::ClientError> for EngineError {
    fn from(e: rumqttc::ClientError) -> Self {
        EngineError::Mqtt(e.to_string())
    }
}

impl From<rumqttc::ConnectionError> for EngineError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        EngineError::Mqtt(e.to_string())
    }
}

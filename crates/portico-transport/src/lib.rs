//! Portico Transport Layer
//!
//! Socket plumbing used by the endpoint runtimes:
//! - Length-prefixed framed streams over plain TCP or TLS
//! - TCP listeners with a configurable backlog
//! - UDP sockets (bound receivers and send-only)
//! - TLS provisioning from PEM material (rustls)

pub mod error;
pub mod stream;
pub mod tls;
pub mod traits;
pub mod udp;

pub use error::{Result, TransportError};
pub use stream::{AsyncStream, FrameReceiver, FrameSender, TcpConfig, TcpServer, TcpTransport};
pub use tls::{MqttTlsMaterial, TlsFiles, TlsProvider};
pub use traits::{TransportEvent, TransportReceiver, TransportSender};
pub use udp::{UdpConfig, UdpReceiver, UdpTransport};

//! TLS provisioning tests
//!
//! Self-signed material is generated per test with rcgen.

use bytes::Bytes;
use portico_transport::{
    MqttTlsMaterial, TcpServer, TcpTransport, TlsFiles, TlsProvider, TransportError,
    TransportEvent, TransportReceiver, TransportSender,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::timeout;

static COUNTER: AtomicU32 = AtomicU32::new(0);

struct Material {
    dir: PathBuf,
    cert: PathBuf,
    key: PathBuf,
}

impl Material {
    fn generate() -> Self {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "portico-tls-{}-{}",
            std::process::id(),
            n
        ));
        std::fs::create_dir_all(&dir).unwrap();

        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
        std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

        Self {
            dir,
            cert: cert_path,
            key: key_path,
        }
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }
}

impl Drop for Material {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[tokio::test]
async fn test_tls_round_trip_with_custom_ca() {
    let material = Material::generate();
    let acceptor = TlsProvider::server(&material.cert, &material.key).unwrap();

    let server = TcpServer::bind("127.0.0.1", 0, 4).await.unwrap();
    let port = server.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (stream, _) = server.accept().await.unwrap();
        let tls = acceptor.accept(stream).await.unwrap();
        let (sender, mut receiver) = TcpTransport::new().framed(tls);
        while let Some(TransportEvent::Data(data)) = receiver.recv().await {
            sender.send(data).await.unwrap();
        }
    });

    let files = TlsFiles {
        ca_file: Some(material.cert.clone()),
        ..Default::default()
    };
    let connector = TlsProvider::client(&files).unwrap();
    let transport = TcpTransport::new();
    let stream = transport.open("127.0.0.1", port).await.unwrap();
    let tls = connector
        .connect(TlsProvider::server_name("localhost").unwrap(), stream)
        .await
        .unwrap();

    let (sender, mut receiver) = transport.framed(tls);
    sender.send(Bytes::from("secret")).await.unwrap();

    match timeout(Duration::from_secs(5), receiver.recv()).await {
        Ok(Some(TransportEvent::Data(data))) => assert_eq!(data, Bytes::from("secret")),
        other => panic!("expected echoed data, got {:?}", other),
    }
}

#[tokio::test]
async fn test_untrusted_server_fails_handshake() {
    let server_material = Material::generate();
    let other_material = Material::generate();
    let acceptor = TlsProvider::server(&server_material.cert, &server_material.key).unwrap();

    let server = TcpServer::bind("127.0.0.1", 0, 4).await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = server.accept().await.unwrap();
        let _ = acceptor.accept(stream).await;
    });

    let files = TlsFiles {
        ca_file: Some(other_material.cert.clone()),
        ..Default::default()
    };
    let connector = TlsProvider::client(&files).unwrap();
    let stream = TcpTransport::new().open("127.0.0.1", port).await.unwrap();
    let result = connector
        .connect(TlsProvider::server_name("localhost").unwrap(), stream)
        .await;
    assert!(result.is_err());
}

#[test]
fn test_missing_ca_file_is_tls_error() {
    let files = TlsFiles {
        ca_file: Some(PathBuf::from("/nonexistent/portico/ca.pem")),
        ..Default::default()
    };
    assert!(matches!(
        TlsProvider::client(&files),
        Err(TransportError::Tls(_))
    ));
}

#[test]
fn test_garbage_certificate_is_tls_error() {
    let material = Material::generate();
    let bogus = material.write("bogus.pem", "not a certificate");
    let result = TlsProvider::server(&bogus, &material.key);
    assert!(matches!(result, Err(TransportError::Tls(_))));
}

#[test]
fn test_certificate_without_key_is_rejected() {
    let material = Material::generate();
    let files = TlsFiles {
        ca_file: Some(material.cert.clone()),
        cert_file: Some(material.cert.clone()),
        key_file: None,
    };
    assert!(matches!(
        TlsProvider::client(&files),
        Err(TransportError::Tls(_))
    ));
}

#[test]
fn test_client_identity_is_accepted() {
    let material = Material::generate();
    let files = TlsFiles {
        ca_file: Some(material.cert.clone()),
        cert_file: Some(material.cert.clone()),
        key_file: Some(material.key.clone()),
    };
    assert!(TlsProvider::client(&files).is_ok());
}

#[test]
fn test_mqtt_material_load() {
    let material = Material::generate();
    let files = TlsFiles {
        ca_file: Some(material.cert.clone()),
        cert_file: Some(material.cert.clone()),
        key_file: Some(material.key.clone()),
    };
    let loaded = MqttTlsMaterial::load(&files).unwrap();
    assert!(!loaded.ca.is_empty());
    assert!(loaded.client_auth.is_some());

    let no_ca = TlsFiles::default();
    assert!(MqttTlsMaterial::load(&no_ca).is_err());

    let bad_key = TlsFiles {
        ca_file: Some(material.cert.clone()),
        cert_file: Some(material.cert.clone()),
        key_file: Some(material.write("bad.key", "-----BEGIN NOTHING-----")),
    };
    assert!(MqttTlsMaterial::load(&bad_key).is_err());
}

#[test]
fn test_invalid_server_name() {
    assert!(TlsProvider::server_name("not a host name!").is_err());
    assert!(TlsProvider::server_name("localhost").is_ok());
}

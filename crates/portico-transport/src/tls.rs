//! TLS provisioning
//!
//! Builds rustls connectors/acceptors from PEM files. Every failure
//! (unreadable file, no certificate, no key, rustls rejection) is returned
//! as [`TransportError::Tls`]; nothing here retries or falls back.

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};

/// PEM material locations for one endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsFiles {
    /// Trust anchors; `None` means the platform trust store
    pub ca_file: Option<PathBuf>,
    /// Certificate chain presented by this side
    pub cert_file: Option<PathBuf>,
    /// Private key matching `cert_file`
    pub key_file: Option<PathBuf>,
}

impl TlsFiles {
    fn identity(&self) -> Result<Option<(&Path, &Path)>> {
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => Ok(Some((cert.as_path(), key.as_path()))),
            (None, None) => Ok(None),
            (Some(_), None) => Err(TransportError::Tls(
                "certificate given without a private key".to_string(),
            )),
            (None, Some(_)) => Err(TransportError::Tls(
                "private key given without a certificate".to_string(),
            )),
        }
    }
}

/// Raw PEM bytes handed to the MQTT client library, validated up front
#[derive(Clone)]
pub struct MqttTlsMaterial {
    pub ca: Vec<u8>,
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl MqttTlsMaterial {
    /// Read and validate CA (and optional client identity) PEM files
    pub fn load(files: &TlsFiles) -> Result<Self> {
        let ca_path = files
            .ca_file
            .as_deref()
            .ok_or_else(|| TransportError::Tls("MQTT TLS requires a CA file".to_string()))?;
        let ca = read_file(ca_path)?;
        parse_certs(&ca, ca_path)?;

        let client_auth = match files.identity()? {
            Some((cert_path, key_path)) => {
                let cert = read_file(cert_path)?;
                parse_certs(&cert, cert_path)?;
                let key = read_file(key_path)?;
                parse_key(&key, key_path)?;
                Some((cert, key))
            }
            None => None,
        };

        Ok(Self { ca, client_auth })
    }
}

impl std::fmt::Debug for MqttTlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTlsMaterial")
            .field("ca_bytes", &self.ca.len())
            .field("client_auth", &self.client_auth.is_some())
            .finish()
    }
}

/// Factory for TLS connectors and acceptors
pub struct TlsProvider;

impl TlsProvider {
    fn crypto() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    /// Build a client connector
    pub fn client(files: &TlsFiles) -> Result<TlsConnector> {
        let roots = match &files.ca_file {
            Some(ca) => custom_roots(ca)?,
            None => native_roots()?,
        };

        let builder = ClientConfig::builder_with_provider(Self::crypto())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);

        let config = match files.identity()? {
            Some((cert, key)) => {
                debug!("TLS client identity from {}", cert.display());
                builder.with_client_auth_cert(load_certs(cert)?, load_key(key)?)?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(TlsConnector::from(Arc::new(config)))
    }

    /// Build a server acceptor from a certificate chain and key
    pub fn server(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
        let config = ServerConfig::builder_with_provider(Self::crypto())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(load_certs(cert)?, load_key(key)?)?;

        info!("TLS server certificate loaded from {}", cert.display());
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// SNI / verification name for `host`
    pub fn server_name(host: &str) -> Result<ServerName<'static>> {
        ServerName::try_from(host.to_string())
            .map_err(|e| TransportError::Tls(format!("invalid server name {}: {}", host, e)))
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| TransportError::Tls(format!("{}: {}", path.display(), e)))
}

fn parse_certs(pem: &[u8], origin: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("{}: {}", origin.display(), e)))?;

    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "{}: no certificate found",
            origin.display()
        )));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8], origin: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| TransportError::Tls(format!("{}: {}", origin.display(), e)))?
        .ok_or_else(|| TransportError::Tls(format!("{}: no private key found", origin.display())))
}

/// Load a PEM certificate chain
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    parse_certs(&read_file(path)?, path)
}

/// Load the first PEM private key
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    parse_key(&read_file(path)?, path)
}

fn custom_roots(ca: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca)? {
        roots.add(cert)?;
    }
    info!("Using {} custom root certificates", roots.len());
    Ok(roots)
}

fn native_roots() -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let result = rustls_native_certs::load_native_certs();

    for err in &result.errors {
        debug!("Certificate loading error: {}", err);
    }
    for cert in result.certs {
        if let Err(e) = roots.add(cert) {
            warn!("Failed to add system cert: {}", e);
        }
    }

    if roots.is_empty() {
        return Err(TransportError::Tls(
            "No root certificates available".to_string(),
        ));
    }
    info!("Loaded {} system root certificates", roots.len());
    Ok(roots)
}

//! TLS identity handling and mutual-authentication configuration.
//!
//! Both ends of the exec channel authenticate with certificates chaining to
//! a shared trust anchor: the agent requires a client certificate on every
//! connection, and the client verifies the agent's certificate against the
//! same CA. Identity material is loaded once per process; validation happens
//! once per connection at handshake time.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Server name the agent's certificate is issued for, used by the client for
/// hostname verification unless the target registry overrides it.
pub const DEFAULT_SERVER_NAME: &str = "vexec-agent";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("private key error: {0}")]
    PrivateKey(String),

    #[error("TLS configuration error: {0}")]
    Config(String),
}

/// PEM identity material for one endpoint: the trust anchor plus this
/// endpoint's own certificate/key pair.
#[derive(Clone)]
pub struct TlsSettings {
    ca_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

impl TlsSettings {
    /// Load identity material from PEM files.
    ///
    /// Fails when any file is unreadable; content errors (swapped files, a
    /// key that does not pair with the certificate) surface from the config
    /// builders below, before any connection is attempted.
    pub fn load(ca: &Path, cert: &Path, key: &Path) -> Result<Self, TlsError> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|source| TlsError::Read {
                path: path.display().to_string(),
                source,
            })
        };
        Ok(Self {
            ca_pem: read(ca)?,
            cert_pem: read(cert)?,
            key_pem: read(key)?,
        })
    }

    /// Build settings from in-memory PEM blobs.
    pub fn from_pem(
        ca_pem: impl Into<Vec<u8>>,
        cert_pem: impl Into<Vec<u8>>,
        key_pem: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            ca_pem: ca_pem.into(),
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    fn root_store(&self) -> Result<RootCertStore, TlsError> {
        let ca_certs = parse_certificates(&self.ca_pem)?;
        if ca_certs.is_empty() {
            return Err(TlsError::Certificate("no CA certificates found".into()));
        }
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| TlsError::Certificate(format!("failed to add CA certificate: {e}")))?;
        }
        Ok(roots)
    }

    fn identity(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
        let certs = parse_certificates(&self.cert_pem)?;
        if certs.is_empty() {
            return Err(TlsError::Certificate("no certificates found".into()));
        }
        let key = parse_private_key(&self.key_pem)?;
        Ok((certs, key))
    }

    /// Client-side config: verify the agent against the CA and present our
    /// own certificate for the agent's client verification.
    pub fn client_config(&self) -> Result<ClientConfig, TlsError> {
        let roots = self.root_store()?;
        let (certs, key) = self.identity()?;
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| TlsError::Config(format!("client config error: {e}")))
    }

    /// Agent-side config: require client certificates chaining to the CA.
    pub fn server_config(&self) -> Result<ServerConfig, TlsError> {
        let roots = self.root_store()?;
        let (certs, key) = self.identity()?;

        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TlsError::Config(format!("client verifier error: {e}")))?;

        ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(format!("server config error: {e}")))
    }

    /// Connector for outbound (client) connections.
    pub fn connector(&self) -> Result<TlsConnector, TlsError> {
        Ok(TlsConnector::from(Arc::new(self.client_config()?)))
    }

    /// Acceptor for inbound (agent) connections.
    pub fn acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        Ok(TlsAcceptor::from(Arc::new(self.server_config()?)))
    }
}

/// Install the process-wide rustls crypto provider. Safe to call more than
/// once; later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("failed to parse certificates: {e}")))
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| TlsError::PrivateKey(format!("failed to parse private key: {e}")))
}

//! Shared harness for end-to-end tests: an in-process agent behind real
//! mutual TLS on a loopback TCP port.
#![allow(dead_code)]

use std::sync::Arc;

use rcgen::{CertificateParams, DnType, KeyPair};
use vexec_guest_agent::server;
use vexec_guest_agent::session::SessionRegistry;
use vexec_guest_agent::vsock::Listener;
use vexec_protocol::tls::{install_crypto_provider, TlsSettings, DEFAULT_SERVER_NAME};

pub struct Harness {
    /// Loopback address the agent listens on.
    pub addr: String,
    /// The agent's session registry, for observing live sessions.
    pub registry: Arc<SessionRegistry>,
    /// Client identity signed by the harness CA.
    pub client_tls: TlsSettings,
    /// CA material for minting additional identities.
    pub ca: (Vec<u8>, Vec<u8>),
}

pub fn generate_ca() -> (Vec<u8>, Vec<u8>) {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, "Test CA");
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let key_pair = KeyPair::generate().expect("key generation should succeed");
    let cert = params
        .self_signed(&key_pair)
        .expect("self-signing should succeed");

    (cert.pem().into_bytes(), key_pair.serialize_pem().into_bytes())
}

pub fn generate_leaf(ca: &(Vec<u8>, Vec<u8>), name: &str) -> (Vec<u8>, Vec<u8>) {
    let ca_key = KeyPair::from_pem(&String::from_utf8_lossy(&ca.1))
        .expect("CA key parsing should succeed");
    let ca_params = CertificateParams::from_ca_cert_pem(&String::from_utf8_lossy(&ca.0))
        .expect("CA cert parsing should succeed");
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .expect("CA self-signing should succeed");

    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, name);
    params.subject_alt_names = vec![rcgen::SanType::DnsName(
        name.try_into().expect("valid DNS name"),
    )];

    let key = KeyPair::generate().expect("leaf key generation should succeed");
    let cert = params
        .signed_by(&key, &ca_cert, &ca_key)
        .expect("leaf signing should succeed");

    (cert.pem().into_bytes(), key.serialize_pem().into_bytes())
}

/// Start an agent on a fresh loopback port and hand back everything a test
/// needs to talk to it.
pub async fn start_agent() -> Harness {
    install_crypto_provider();

    let ca = generate_ca();
    let (server_cert, server_key) = generate_leaf(&ca, DEFAULT_SERVER_NAME);
    let (client_cert, client_key) = generate_leaf(&ca, "vexec-client");

    let server_tls = TlsSettings::from_pem(ca.0.clone(), server_cert, server_key);
    let acceptor = server_tls.acceptor().expect("agent acceptor");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr").to_string();

    let registry = Arc::new(SessionRegistry::new());
    let serve_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        let _ = server::serve(Listener::Tcp(listener), acceptor, serve_registry).await;
    });

    Harness {
        addr,
        registry,
        client_tls: TlsSettings::from_pem(ca.0.clone(), client_cert, client_key),
        ca,
    }
}

/// Target record pointing at the harness agent.
pub fn target_for(harness: &Harness) -> vexec::target::TargetInfo {
    vexec::target::TargetInfo {
        id: Some("test-guest".to_string()),
        cid: None,
        port: None,
        addr: Some(harness.addr.clone()),
        server_name: None,
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vexec_guest_agent::config::Config;
use vexec_guest_agent::server;
use vexec_guest_agent::session::SessionRegistry;
use vexec_guest_agent::vsock;
use vexec_protocol::tls::{self, TlsSettings};

#[derive(Parser)]
#[command(name = "vexec-agent", about = "In-guest exec agent for vexec")]
struct Cli {
    /// Path to config file (TOML). Defaults apply when omitted.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };

    tls::install_crypto_provider();
    let settings = TlsSettings::load(
        &config.tls.ca_path,
        &config.tls.cert_path,
        &config.tls.key_path,
    )
    .context("failed to load TLS identity")?;
    let acceptor = settings
        .acceptor()
        .context("failed to build TLS acceptor")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.listen.port,
        "vexec agent starting"
    );

    let listener = vsock::listen(config.listen.port).await?;
    let registry = Arc::new(SessionRegistry::new());

    // Serve until a termination signal arrives. Children of live sessions
    // are killed when their handles drop with the runtime (kill_on_drop).
    tokio::select! {
        result = server::serve(listener, acceptor, registry) => result,
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping agent");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

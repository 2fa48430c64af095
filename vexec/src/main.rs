use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vexec::client;
use vexec::target;
use vexec_protocol::tls::{self, TlsSettings};
use vexec_protocol::ExecRequest;

/// Default directory for the client's PEM identity material, overridable
/// with VEXEC_CERT_DIR or the individual --tls* flags.
const CERT_DIR_ENV: &str = "VEXEC_CERT_DIR";
const DEFAULT_CERT_DIR: &str = "/var/lib/vexec/certs";

#[derive(Parser)]
#[command(
    name = "vexec",
    about = "Run a command inside a running guest",
    after_help = "The process exits with the remote command's exit code.\n\
                  Fixed failure codes: unknown target, TLS rejection or disabled \
                  guest policy exit 1; a non-executable target exits 126."
)]
struct Cli {
    /// Allocate a pseudo-terminal for the remote command
    #[arg(short = 't', long)]
    tty: bool,

    /// Keep stdin attached to the remote command
    #[arg(short = 'i', long)]
    interactive: bool,

    /// Environment override, KEY=VALUE (repeatable)
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Working directory for the remote command (default: inherited)
    #[arg(short = 'w', long, value_name = "DIR")]
    workdir: Option<String>,

    /// Client certificate path
    #[arg(long, value_name = "PATH")]
    tlscert: Option<PathBuf>,

    /// Client private key path
    #[arg(long, value_name = "PATH")]
    tlskey: Option<PathBuf>,

    /// Trust anchor (CA certificate) path
    #[arg(long, value_name = "PATH")]
    tlsca: Option<PathBuf>,

    /// Guest name or id
    target: String,

    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("vexec: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let env = parse_env_overrides(&cli.env)?;

    let state_dir = target::state_dir();
    let info = target::resolve(&state_dir, &cli.target)?;

    let cert_dir = std::env::var(CERT_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CERT_DIR));
    let ca = cli.tlsca.unwrap_or_else(|| cert_dir.join("ca.pem"));
    let cert = cli.tlscert.unwrap_or_else(|| cert_dir.join("cert.pem"));
    let key = cli.tlskey.unwrap_or_else(|| cert_dir.join("key.pem"));

    tls::install_crypto_provider();
    let settings = TlsSettings::load(&ca, &cert, &key)?;

    let request = ExecRequest {
        command: cli.command[0].clone(),
        args: cli.command[1..].to_vec(),
        env,
        workdir: cli.workdir,
        tty: cli.tty,
    };

    // A tty session always needs the local terminal's input.
    let forward_stdin = cli.interactive || cli.tty;
    client::execute(&info, &settings, request, forward_stdin).await
}

/// Parse repeated `-e KEY=VALUE` flags. Later values win for repeated keys;
/// the value may itself contain '='.
fn parse_env_overrides(overrides: &[String]) -> Result<HashMap<String, String>> {
    let mut env = HashMap::new();
    for entry in overrides {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("invalid environment override (expected KEY=VALUE): {entry}");
        };
        if key.is_empty() {
            bail!("invalid environment override (empty key): {entry}");
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

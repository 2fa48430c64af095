use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Env toggle that disables all remote execution in this guest. Re-read on
/// every accepted connection so flipping it needs no agent restart.
pub const NOEXEC_ENV: &str = "VEXEC_NOEXEC";

/// Top-level configuration for the exec agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: ListenConfig,
    pub tls: TlsPathsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            tls: TlsPathsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.listen.port != 0, "listen.port must be non-zero");
        Ok(())
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Vsock port (also the TCP port when falling back).
    pub port: u32,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: vexec_protocol::AGENT_PORT,
        }
    }
}

/// Paths to the agent's PEM identity material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsPathsConfig {
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for TlsPathsConfig {
    fn default() -> Self {
        Self {
            ca_path: "/var/lib/vexec/certs/ca.pem".into(),
            cert_path: "/var/lib/vexec/certs/cert.pem".into(),
            key_path: "/var/lib/vexec/certs/key.pem".into(),
        }
    }
}

/// Whether remote execution is currently disabled by guest policy.
pub fn exec_disabled() -> bool {
    policy_disabled(std::env::var(NOEXEC_ENV).ok().as_deref())
}

/// Any non-empty value other than "0" disables execution.
pub fn policy_disabled(value: Option<&str>) -> bool {
    matches!(value, Some(v) if !v.is_empty() && v != "0")
}

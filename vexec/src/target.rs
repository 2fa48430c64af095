//! Guest target resolution.
//!
//! The outer runtime maintains one JSON file per running guest under the
//! state directory, naming the guest's agent endpoint. The client treats
//! this as an opaque lookup: whatever goes wrong, the caller sees a uniform
//! "target not found" and exits 1.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const STATE_DIR_ENV: &str = "VEXEC_STATE_DIR";
pub const DEFAULT_STATE_DIR: &str = "/run/vexec";

/// Endpoint record published by the outer runtime for one guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInfo {
    /// Opaque guest id; targets may be looked up by name or id prefix.
    #[serde(default)]
    pub id: Option<String>,
    /// Vsock endpoint (used when `addr` is unset).
    #[serde(default)]
    pub cid: Option<u32>,
    #[serde(default)]
    pub port: Option<u32>,
    /// TCP endpoint, e.g. "127.0.0.1:4444".
    #[serde(default)]
    pub addr: Option<String>,
    /// Expected TLS server name; defaults to the well-known agent name.
    #[serde(default)]
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Vsock { cid: u32, port: u32 },
    Tcp { addr: String },
}

impl TargetInfo {
    pub fn endpoint(&self) -> Result<Endpoint, TargetError> {
        if let Some(addr) = &self.addr {
            return Ok(Endpoint::Tcp { addr: addr.clone() });
        }
        if let Some(cid) = self.cid {
            return Ok(Endpoint::Vsock {
                cid,
                port: self.port.unwrap_or(vexec_protocol::AGENT_PORT),
            });
        }
        Err(TargetError::Invalid(
            "target record has neither addr nor cid".to_string(),
        ))
    }
}

/// State directory, overridable for tests and non-standard runtimes.
pub fn state_dir() -> PathBuf {
    std::env::var(STATE_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_STATE_DIR))
}

/// Look up a guest by name or id (prefix). Name lookup is a direct file
/// read; id lookup scans the directory.
pub fn resolve(dir: &Path, target: &str) -> Result<TargetInfo, TargetError> {
    let by_name = dir.join(format!("{target}.json"));
    if let Ok(content) = std::fs::read_to_string(&by_name) {
        return parse_record(&content);
    }

    let entries = std::fs::read_dir(dir)
        .map_err(|_| TargetError::NotFound(target.to_string()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Ok(info) = parse_record(&content) else {
            continue;
        };
        if let Some(id) = &info.id {
            if id == target || id.starts_with(target) {
                return Ok(info);
            }
        }
    }

    Err(TargetError::NotFound(target.to_string()))
}

fn parse_record(content: &str) -> Result<TargetInfo, TargetError> {
    serde_json::from_str(content).map_err(|e| TargetError::Invalid(e.to_string()))
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("target not found: {0}")]
    NotFound(String),

    #[error("invalid target record: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_record(dir: &Path, name: &str, json: &str) {
        std::fs::write(dir.join(format!("{name}.json")), json).unwrap();
    }

    #[test]
    fn test_resolve_by_name() {
        let dir = tempfile::tempdir().unwrap();
        write_record(dir.path(), "mongo", r#"{"id": "abc123", "cid": 5}"#);

        let info = resolve(dir.path(), "mongo").unwrap();
        assert_eq!(info.id.as_deref(), Some("abc123"));
        assert_eq!(
            info.endpoint().unwrap(),
            Endpoint::Vsock {
                cid: 5,
                port: vexec_protocol::AGENT_PORT
            }
        );
    }

    #[test]
    fn test_resolve_by_id_prefix() {
        let dir = tempfile::tempdir().unwrap();
        write_record(
            dir.path(),
            "web",
            r#"{"id": "deadbeef01", "addr": "127.0.0.1:9000"}"#,
        );

        let info = resolve(dir.path(), "deadbeef").unwrap();
        assert_eq!(
            info.endpoint().unwrap(),
            Endpoint::Tcp {
                addr: "127.0.0.1:9000".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_target_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        write_record(dir.path(), "web", r#"{"id": "deadbeef01", "cid": 4}"#);

        let err = resolve(dir.path(), "no-such-guest").unwrap_err();
        assert!(matches!(err, TargetError::NotFound(_)));
    }

    #[test]
    fn test_missing_state_dir_is_not_found() {
        let err = resolve(Path::new("/nonexistent/vexec-state"), "guest").unwrap_err();
        assert!(matches!(err, TargetError::NotFound(_)));
    }

    #[test]
    fn test_record_without_endpoint_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        write_record(dir.path(), "broken", r#"{"id": "x"}"#);

        let info = resolve(dir.path(), "broken").unwrap();
        assert!(matches!(info.endpoint(), Err(TargetError::Invalid(_))));
    }

    #[test]
    fn test_explicit_port_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        write_record(dir.path(), "g", r#"{"cid": 3, "port": 5555}"#);

        let info = resolve(dir.path(), "g").unwrap();
        assert_eq!(
            info.endpoint().unwrap(),
            Endpoint::Vsock { cid: 3, port: 5555 }
        );
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub mod tls;

/// Vsock port the exec agent listens on. Used by the host-side client.
pub const AGENT_PORT: u32 = 4444;

/// Maximum message size (16 MiB) to prevent unbounded allocations.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Read buffer size for stdio relay chunks.
pub const IO_CHUNK_SIZE: usize = 32 * 1024;

/// Framing: each message is a 4-byte big-endian length prefix followed by JSON
/// bytes. The length prefix encodes the size of the JSON payload only (not
/// including itself).

// ---------------------------------------------------------------------------
// Host -> Guest messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Start a command in the guest. Must be the first frame on a connection.
    Exec(ExecRequest),

    /// Stdin bytes for the running session. An empty chunk signals stdin EOF.
    Stdin(StdinChunk),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Command path or bare name (resolved on the guest's PATH).
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// KEY=VALUE overrides merged over the guest's base environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory; inherited from the agent when unset.
    #[serde(default)]
    pub workdir: Option<String>,
    /// Allocate a pseudo-terminal for the command.
    #[serde(default)]
    pub tty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdinChunk {
    pub data: Vec<u8>,
}

impl StdinChunk {
    /// An empty chunk is the stdin-closed marker.
    pub fn is_eof(&self) -> bool {
        self.data.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Guest -> Host messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentMessage {
    /// The request was accepted and the command spawned.
    Started { session: u64 },

    /// Output bytes. In tty mode all PTY output arrives as Stdout.
    Stdout { data: Vec<u8> },
    Stderr { data: Vec<u8> },

    /// The command's real exit status. Always the final frame on a session,
    /// sent only after both output streams have been drained.
    Exited { code: i32 },

    /// Terminal refusal; no session was created or the session died early.
    Error(ErrorResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Remote execution is disabled by guest policy.
    ExecDisabled,
    /// The command path does not resolve to an executable regular file.
    NotExecutable,
    /// The command resolved but the spawn itself failed.
    SpawnFailed,
    InvalidRequest,
    Internal,
}

impl ErrorCode {
    /// The exit status the client process reports for this error.
    ///
    /// 126 follows the shell convention for "found but not executable";
    /// everything else is an ordinary failure.
    pub fn client_exit_code(self) -> i32 {
        match self {
            ErrorCode::NotExecutable => 126,
            _ => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message too large: {len} bytes (max {max})")]
    TooLarge { len: u32, max: u32 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// True when the peer closed the connection rather than sending garbage.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            )
        )
    }
}

/// Encode a message to wire format (length-prefixed JSON).
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;

    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Read one length-prefixed message from `reader`.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncReadExt + Unpin,
    T: serde::de::DeserializeOwned,
{
    let len = reader.read_u32().await?;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge {
            len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Write one length-prefixed message to `writer` and flush.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), ProtocolError>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let encoded = encode_message(msg)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Frame layout
    // -----------------------------------------------------------------------

    #[test]
    fn test_encode_length_prefix() {
        let msg = ClientMessage::Exec(ExecRequest {
            command: "/bin/true".to_string(),
            args: vec![],
            env: HashMap::new(),
            workdir: None,
            tty: false,
        });
        let encoded = encode_message(&msg).unwrap();

        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len() - 4);

        // The JSON payload should deserialize back
        let decoded: ClientMessage = serde_json::from_slice(&encoded[4..]).unwrap();
        match decoded {
            ClientMessage::Exec(req) => assert_eq!(req.command, "/bin/true"),
            other => panic!("expected Exec, got {:?}", other),
        }
    }

    #[test]
    fn test_serde_tag_layout() {
        let msg = AgentMessage::Exited { code: 42 };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"Exited""#));
    }

    #[test]
    fn test_exec_request_defaults() {
        // Only `command` is required on the wire; everything else defaults.
        let req: ExecRequest = serde_json::from_str(r#"{"command": "uname"}"#).unwrap();
        assert_eq!(req.command, "uname");
        assert!(req.args.is_empty());
        assert!(req.env.is_empty());
        assert!(req.workdir.is_none());
        assert!(!req.tty);
    }

    #[test]
    fn test_stdin_chunk_eof_marker() {
        assert!(StdinChunk { data: vec![] }.is_eof());
        assert!(!StdinChunk { data: vec![0] }.is_eof());
    }

    // -----------------------------------------------------------------------
    // Read/write round-trip over in-memory stream
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let msg = ClientMessage::Exec(ExecRequest {
            command: "env".to_string(),
            args: vec!["-0".to_string()],
            env: HashMap::from([("FOO".to_string(), "42".to_string())]),
            workdir: Some("/tmp".to_string()),
            tty: true,
        });

        let (client, server) = tokio::io::duplex(4096);
        let (mut server_read, _server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);

        write_message(&mut client_write, &msg).await.unwrap();

        let decoded: ClientMessage = read_message(&mut server_read).await.unwrap();
        match decoded {
            ClientMessage::Exec(req) => {
                assert_eq!(req.command, "env");
                assert_eq!(req.args, vec!["-0"]);
                assert_eq!(req.env.get("FOO").map(String::as_str), Some("42"));
                assert_eq!(req.workdir.as_deref(), Some("/tmp"));
                assert!(req.tty);
            }
            other => panic!("expected Exec, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_binary_payload_roundtrip() {
        // Stdout chunks must carry arbitrary bytes unmodified.
        let data: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();
        let msg = AgentMessage::Stdout { data: data.clone() };

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (mut server_read, _sw) = tokio::io::split(server);
        let (_cr, mut client_write) = tokio::io::split(client);

        write_message(&mut client_write, &msg).await.unwrap();
        let decoded: AgentMessage = read_message(&mut server_read).await.unwrap();
        match decoded {
            AgentMessage::Stdout { data: got } => assert_eq!(got, data),
            other => panic!("expected Stdout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_frame() {
        let (client, server) = tokio::io::duplex(64);
        let (mut server_read, _sw) = tokio::io::split(server);
        let (_cr, mut client_write) = tokio::io::split(client);

        // A length prefix past the cap must be rejected before allocation.
        let bad = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        client_write.write_all(&bad).await.unwrap();

        let result: Result<AgentMessage, _> = read_message(&mut server_read).await;
        assert!(matches!(result, Err(ProtocolError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn test_read_truncated_frame_is_disconnect() {
        let (client, server) = tokio::io::duplex(64);
        let (mut server_read, _sw) = tokio::io::split(server);
        let (client_read, mut client_write) = tokio::io::split(client);

        // Claim 100 bytes but close after 2.
        client_write.write_all(&100u32.to_be_bytes()).await.unwrap();
        client_write.write_all(b"{}").await.unwrap();
        drop(client_write);
        drop(client_read);

        let result: Result<ClientMessage, _> = read_message(&mut server_read).await;
        let err = result.unwrap_err();
        assert!(err.is_disconnect(), "unexpected error: {err}");
    }

    // -----------------------------------------------------------------------
    // Client exit-status mapping
    // -----------------------------------------------------------------------

    #[test]
    fn test_error_code_exit_status() {
        assert_eq!(ErrorCode::NotExecutable.client_exit_code(), 126);
        assert_eq!(ErrorCode::ExecDisabled.client_exit_code(), 1);
        assert_eq!(ErrorCode::SpawnFailed.client_exit_code(), 1);
        assert_eq!(ErrorCode::InvalidRequest.client_exit_code(), 1);
        assert_eq!(ErrorCode::Internal.client_exit_code(), 1);
    }
}

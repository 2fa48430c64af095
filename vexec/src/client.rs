//! Exec session client: connect, authenticate, stream stdio, return the
//! remote exit status.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::debug;
use vexec_protocol::tls::{TlsSettings, DEFAULT_SERVER_NAME};
use vexec_protocol::{
    read_message, write_message, AgentMessage, ClientMessage, ExecRequest, StdinChunk,
    IO_CHUNK_SIZE,
};

use crate::target::{Endpoint, TargetInfo};
use crate::terminal::{stdin_is_tty, RawModeGuard};
use crate::vsock;

/// Run one exec session against a resolved target. Returns the exit status
/// this process should terminate with: the remote command's own code, or
/// the fixed failure code for refusals (126 for exec-permission errors,
/// 1 for everything else). Transport and handshake failures are errors;
/// the caller maps them to 1.
///
/// `forward_stdin` attaches the local stdin to the remote command; when
/// false the remote stdin is closed immediately.
pub async fn execute(
    target: &TargetInfo,
    tls: &TlsSettings,
    request: ExecRequest,
    forward_stdin: bool,
) -> Result<i32> {
    let connector = tls.connector().context("TLS identity rejected")?;
    let server_name = target
        .server_name
        .clone()
        .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());
    let server_name =
        ServerName::try_from(server_name).context("invalid TLS server name for target")?;

    match target.endpoint().context("unusable target record")? {
        Endpoint::Tcp { addr } => {
            let stream = TcpStream::connect(&addr)
                .await
                .with_context(|| format!("failed to connect to {addr}"))?;
            let stream = connector
                .connect(server_name, stream)
                .await
                .context("TLS handshake failed")?;
            run_session(stream, request, forward_stdin).await
        }
        Endpoint::Vsock { cid, port } => {
            let stream = vsock::connect(cid, port).await?;
            let stream = connector
                .connect(server_name, stream)
                .await
                .context("TLS handshake failed")?;
            run_session(stream, request, forward_stdin).await
        }
    }
}

/// Drive the session protocol over an established, authenticated stream.
async fn run_session<S>(mut stream: S, request: ExecRequest, forward_stdin: bool) -> Result<i32>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let tty = request.tty;
    write_message(&mut stream, &ClientMessage::Exec(request))
        .await
        .context("failed to send exec request")?;

    match read_message::<_, AgentMessage>(&mut stream)
        .await
        .context("connection lost before the session started")?
    {
        AgentMessage::Started { session } => {
            debug!(session, "remote session started");
        }
        AgentMessage::Error(e) => {
            eprintln!("vexec: {}", e.message);
            return Ok(e.code.client_exit_code());
        }
        other => bail!("unexpected frame before session start: {other:?}"),
    }

    // Raw mode for the whole relay; the guard restores the terminal on
    // every exit path.
    let _raw = if tty && stdin_is_tty() {
        Some(RawModeGuard::new()?)
    } else {
        None
    };

    let (mut reader, writer) = tokio::io::split(stream);
    let stdin_pump = tokio::spawn(pump_stdin(writer, forward_stdin));

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    let result = loop {
        match read_message::<_, AgentMessage>(&mut reader).await {
            Ok(AgentMessage::Stdout { data }) => {
                stdout.write_all(&data).await?;
                stdout.flush().await?;
            }
            Ok(AgentMessage::Stderr { data }) => {
                stderr.write_all(&data).await?;
                stderr.flush().await?;
            }
            Ok(AgentMessage::Exited { code }) => break Ok(code),
            Ok(AgentMessage::Error(e)) => {
                eprintln!("vexec: {}", e.message);
                break Ok(e.code.client_exit_code());
            }
            Ok(AgentMessage::Started { .. }) => {
                break Err(anyhow::anyhow!("duplicate session start frame"));
            }
            // Everything relayed so far has already been written out;
            // only the exit status is missing.
            Err(e) => break Err(anyhow::anyhow!("connection lost mid-session: {e}")),
        }
    };

    stdin_pump.abort();
    result
}

/// Forward local stdin to the agent until EOF; an empty chunk tells the
/// agent to close the remote stdin. Without `forward`, the remote stdin is
/// closed up front and local stdin is never touched.
async fn pump_stdin<W>(mut writer: W, forward: bool)
where
    W: AsyncWriteExt + Unpin,
{
    if !forward {
        let _ = write_message(
            &mut writer,
            &ClientMessage::Stdin(StdinChunk { data: Vec::new() }),
        )
        .await;
        return;
    }

    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; IO_CHUNK_SIZE];

    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = write_message(
                    &mut writer,
                    &ClientMessage::Stdin(StdinChunk { data: Vec::new() }),
                )
                .await;
                return;
            }
            Ok(n) => {
                let chunk = ClientMessage::Stdin(StdinChunk {
                    data: buf[..n].to_vec(),
                });
                if write_message(&mut writer, &chunk).await.is_err() {
                    return;
                }
            }
        }
    }
}

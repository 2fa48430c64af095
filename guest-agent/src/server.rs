//! Accept loop and per-connection exec handling.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};
use vexec_protocol::{
    read_message, write_message, AgentMessage, ClientMessage, ErrorCode, ErrorResponse,
};

use crate::config;
use crate::exec;
use crate::relay;
use crate::session::SessionRegistry;
use crate::vsock::Listener;

/// Accept connections forever, one task per connection. The TLS handshake
/// happens before any frame is read; handshake failures are logged and the
/// connection dropped, with no session created.
pub async fn serve(
    listener: Listener,
    acceptor: TlsAcceptor,
    registry: Arc<SessionRegistry>,
) -> Result<()> {
    match listener {
        Listener::Vsock(vsock) => loop {
            let (stream, peer_cid) = vsock.accept().await?;
            accept_one(stream, format!("vsock:cid={peer_cid}"), &acceptor, &registry);
        },
        Listener::Tcp(tcp) => loop {
            let (stream, addr) = tcp.accept().await?;
            accept_one(stream, format!("tcp:{addr}"), &acceptor, &registry);
        },
    }
}

fn accept_one<S>(stream: S, peer: String, acceptor: &TlsAcceptor, registry: &Arc<SessionRegistry>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let acceptor = acceptor.clone();
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        // Policy is re-read per connection so the toggle takes effect
        // without an agent restart.
        let disabled = config::exec_disabled();

        match acceptor.accept(stream).await {
            Ok(tls) => {
                info!(peer = %peer, "connection authenticated");
                handle_connection(tls, registry, disabled, &peer).await;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "TLS handshake failed");
            }
        }
    });
}

/// Handle one authenticated connection: exactly one exec session.
pub async fn handle_connection<S>(
    stream: S,
    registry: Arc<SessionRegistry>,
    exec_disabled: bool,
    peer: &str,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let request = match read_message::<_, ClientMessage>(&mut reader).await {
        Ok(ClientMessage::Exec(req)) => req,
        Ok(other) => {
            warn!(peer = %peer, "first frame was not an exec request: {:?}", other);
            let _ = refuse(&mut writer, ErrorCode::InvalidRequest, "expected exec request").await;
            return;
        }
        Err(e) => {
            if !e.is_disconnect() {
                warn!(peer = %peer, error = %e, "failed to read exec request");
            }
            return;
        }
    };

    if exec_disabled {
        info!(peer = %peer, command = %request.command, "exec refused by guest policy");
        let _ = refuse(
            &mut writer,
            ErrorCode::ExecDisabled,
            "remote execution is disabled by guest policy",
        )
        .await;
        return;
    }

    if request.command.is_empty() {
        let _ = refuse(&mut writer, ErrorCode::InvalidRequest, "empty command").await;
        return;
    }

    let resolved = match exec::resolve_command(&request.command) {
        Ok(path) => path,
        Err(e) => {
            info!(peer = %peer, command = %request.command, "command resolution failed: {e}");
            let _ = refuse(&mut writer, ErrorCode::NotExecutable, &e.to_string()).await;
            return;
        }
    };

    let spawned = match exec::spawn(&resolved, &request) {
        Ok(spawned) => spawned,
        Err(e) => {
            warn!(peer = %peer, command = %request.command, error = %e, "spawn failed");
            let _ = refuse(&mut writer, ErrorCode::SpawnFailed, &format!("{e:#}")).await;
            return;
        }
    };

    let id = registry.register(spawned.pid(), request.tty).await;
    info!(
        peer = %peer,
        session = id,
        pid = spawned.pid().unwrap_or(0),
        command = %request.command,
        tty = request.tty,
        "session started"
    );

    if write_message(&mut writer, &AgentMessage::Started { session: id })
        .await
        .is_err()
    {
        // Client vanished between connect and spawn; tear the child down.
        let mut spawned = spawned;
        let _ = spawned.child.kill().await;
        registry.fail(id, "client disconnected").await;
        registry.remove(id).await;
        return;
    }

    let (tx, rx) = mpsc::channel(16);
    let inbound = tokio::spawn(relay::pump_inbound(reader, tx));

    match relay::run(&mut writer, rx, spawned).await {
        Ok(code) => {
            registry.finish(id, code).await;
            info!(session = id, code, "session exited");
            if let Err(e) = write_message(&mut writer, &AgentMessage::Exited { code }).await {
                warn!(session = id, error = %e, "failed to deliver exit status");
            }
        }
        Err(reason) => {
            registry.fail(id, &reason).await;
            info!(session = id, reason = %reason, "session failed");
        }
    }

    registry.remove(id).await;
    inbound.abort();
}

async fn refuse<W>(writer: &mut W, code: ErrorCode, message: &str) -> Result<()>
where
    W: tokio::io::AsyncWriteExt + Unpin,
{
    write_message(
        writer,
        &AgentMessage::Error(ErrorResponse {
            code,
            message: message.to_string(),
        }),
    )
    .await?;
    Ok(())
}

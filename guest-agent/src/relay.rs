//! Bidirectional stdio relay between the connection and the spawned child.
//!
//! One relay per session, run on the connection's own task. The exit-status
//! frame is only written after both output streams have been drained to EOF,
//! so it is always the last frame on the wire. A dropped connection kills
//! the child; the agent never leaves orphans behind.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use vexec_protocol::{write_message, AgentMessage, ClientMessage, IO_CHUNK_SIZE};

use crate::exec::{exit_code, ChildIo, Spawned};
use crate::pty::PtyMaster;

/// Frames arriving from the client while the session runs.
#[derive(Debug)]
pub enum Inbound {
    Stdin(Vec<u8>),
    Disconnected,
}

/// Pump inbound frames into a channel until the client disconnects.
///
/// Runs on its own task so that frame reads (`read_exact` is not
/// cancellation-safe) never race the relay's `select!` loop.
pub async fn pump_inbound<R>(mut reader: R, tx: mpsc::Sender<Inbound>)
where
    R: AsyncReadExt + Unpin,
{
    loop {
        match vexec_protocol::read_message::<_, ClientMessage>(&mut reader).await {
            Ok(ClientMessage::Stdin(chunk)) => {
                if tx.send(Inbound::Stdin(chunk.data)).await.is_err() {
                    return;
                }
            }
            Ok(ClientMessage::Exec(_)) => {
                // One session per connection; a second Exec is a protocol
                // violation and ends the session.
                let _ = tx.send(Inbound::Disconnected).await;
                return;
            }
            Err(_) => {
                let _ = tx.send(Inbound::Disconnected).await;
                return;
            }
        }
    }
}

/// Relay the session to completion. Returns the child's exit code, or an
/// error description if the connection died first (the child is killed).
pub async fn run<W>(
    writer: &mut W,
    inbound: mpsc::Receiver<Inbound>,
    spawned: Spawned,
) -> Result<i32, String>
where
    W: AsyncWriteExt + Unpin,
{
    let Spawned { mut child, io } = spawned;
    let result = match io {
        ChildIo::Pipes {
            stdin,
            stdout,
            stderr,
        } => run_pipes(writer, inbound, stdin, stdout, stderr).await,
        ChildIo::Pty { master } => run_pty(writer, inbound, master).await,
    };

    match result {
        Ok(()) => {
            let status = child
                .wait()
                .await
                .map_err(|e| format!("wait failed: {e}"))?;
            Ok(exit_code(status))
        }
        Err(reason) => {
            // Connection gone or write failed: terminate and reap the child.
            let _ = child.kill().await;
            Err(reason)
        }
    }
}

async fn send<W: AsyncWriteExt + Unpin>(writer: &mut W, msg: &AgentMessage) -> Result<(), String> {
    write_message(writer, msg)
        .await
        .map_err(|e| format!("write to client failed: {e}"))
}

/// Non-tty: three independent byte streams. stdout and stderr are each
/// internally ordered and lossless; interleaving between them is
/// best-effort.
async fn run_pipes<W>(
    writer: &mut W,
    mut inbound: mpsc::Receiver<Inbound>,
    mut stdin: Option<tokio::process::ChildStdin>,
    mut stdout: tokio::process::ChildStdout,
    mut stderr: tokio::process::ChildStderr,
) -> Result<(), String>
where
    W: AsyncWriteExt + Unpin,
{
    let mut out_buf = vec![0u8; IO_CHUNK_SIZE];
    let mut err_buf = vec![0u8; IO_CHUNK_SIZE];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => {
                    send(writer, &AgentMessage::Stdout { data: out_buf[..n].to_vec() }).await?;
                }
            },
            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => {
                    send(writer, &AgentMessage::Stderr { data: err_buf[..n].to_vec() }).await?;
                }
            },
            msg = inbound.recv() => match msg {
                Some(Inbound::Stdin(data)) if data.is_empty() => {
                    // Stdin EOF: dropping the handle closes the pipe.
                    stdin.take();
                }
                Some(Inbound::Stdin(data)) => {
                    if let Some(pipe) = stdin.as_mut() {
                        // A child that closed its stdin early is not an
                        // error; keep draining its output.
                        if pipe.write_all(&data).await.is_err() || pipe.flush().await.is_err() {
                            stdin.take();
                        }
                    }
                }
                Some(Inbound::Disconnected) | None => {
                    return Err("client disconnected".to_string());
                }
            },
        }
    }
    Ok(())
}

/// tty: a single PTY byte stream in each direction, relayed verbatim so
/// control sequences pass through untouched.
async fn run_pty<W>(
    writer: &mut W,
    mut inbound: mpsc::Receiver<Inbound>,
    master: PtyMaster,
) -> Result<(), String>
where
    W: AsyncWriteExt + Unpin,
{
    let (mut master_read, mut master_write) = tokio::io::split(master);
    let mut buf = vec![0u8; IO_CHUNK_SIZE];

    loop {
        tokio::select! {
            read = master_read.read(&mut buf) => match read {
                Ok(0) | Err(_) => return Ok(()),
                Ok(n) => {
                    send(writer, &AgentMessage::Stdout { data: buf[..n].to_vec() }).await?;
                }
            },
            msg = inbound.recv() => match msg {
                Some(Inbound::Stdin(data)) if data.is_empty() => {
                    // A PTY has no separate write end to close; nothing to do.
                }
                Some(Inbound::Stdin(data)) => {
                    if master_write.write_all(&data).await.is_err() {
                        return Ok(());
                    }
                }
                Some(Inbound::Disconnected) | None => {
                    return Err("client disconnected".to_string());
                }
            },
        }
    }
}

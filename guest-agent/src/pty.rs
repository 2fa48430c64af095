//! Pseudo-terminal allocation for tty-mode sessions.
//!
//! The master side stays in the agent and is pumped by the relay; the slave
//! becomes the child's controlling terminal via `pre_exec` (setsid +
//! TIOCSCTTY + dup2 onto stdio).

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::task::Poll;

use anyhow::{bail, Context, Result};
use nix::pty::{openpty, Winsize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A PTY pair. The slave is kept only until the child has been spawned.
pub struct Pty {
    master: OwnedFd,
    slave: Option<OwnedFd>,
}

impl Pty {
    /// Open a new PTY pair. Window-size changes are not propagated, so the
    /// pair is opened at a fixed 80x24.
    pub fn open() -> Result<Self> {
        let winsize = Winsize {
            ws_row: 24,
            ws_col: 80,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pair = openpty(Some(&winsize), None).context("failed to open PTY pair")?;
        Ok(Self {
            master: pair.master,
            slave: Some(pair.slave),
        })
    }

    /// Raw fd of the slave side, for `pre_exec` wiring in the child.
    pub fn slave_fd(&self) -> RawFd {
        self.slave.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }

    /// Drop the slave in the parent and turn the master into an async
    /// handle. Closing the parent's slave fd is what lets master reads
    /// observe EOF once the child's copies are gone.
    pub fn into_master(mut self) -> Result<PtyMaster> {
        self.slave.take();
        set_nonblocking(self.master.as_raw_fd())?;
        PtyMaster::new(self.master)
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        bail!(
            "fcntl(F_GETFL) on PTY master failed: {}",
            std::io::Error::last_os_error()
        );
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        bail!(
            "fcntl(F_SETFL) on PTY master failed: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

/// Async PTY master backed by `AsyncFd<OwnedFd>` with raw read/write.
///
/// The master fd is not a socket, so it cannot be wrapped in any tokio net
/// type; `AsyncRead`/`AsyncWrite` are implemented directly via
/// `libc::read`/`libc::write`, the same shape used for vsock streams.
pub struct PtyMaster {
    inner: tokio::io::unix::AsyncFd<OwnedFd>,
}

impl PtyMaster {
    fn new(fd: OwnedFd) -> Result<Self> {
        let inner = tokio::io::unix::AsyncFd::new(fd)
            .context("failed to register PTY master with tokio")?;
        Ok(Self { inner })
    }
}

impl AsyncRead for PtyMaster {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            let mut guard = match self.inner.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe {
                    libc::read(fd, unfilled.as_mut_ptr() as *mut libc::c_void, unfilled.len())
                };
                if n >= 0 {
                    Ok(n as usize)
                } else {
                    Err(std::io::Error::last_os_error())
                }
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                // EIO from a PTY master means every slave fd is closed, i.e.
                // the child is done writing. Surface it as EOF.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => {
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PtyMaster {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        loop {
            let mut guard = match self.inner.poll_write_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
                if n >= 0 {
                    Ok(n as usize)
                } else {
                    Err(std::io::Error::last_os_error())
                }
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pty_open() {
        let pty = Pty::open().unwrap();
        assert!(pty.slave_fd() >= 0);
    }

    #[tokio::test]
    async fn test_master_reads_slave_output() {
        use tokio::io::AsyncReadExt;

        let pty = Pty::open().unwrap();
        let slave_fd = pty.slave_fd();

        // Bytes written into the slave surface on the master side.
        let payload = b"hi";
        let n = unsafe {
            libc::write(slave_fd, payload.as_ptr() as *const libc::c_void, payload.len())
        };
        assert_eq!(n, payload.len() as isize);

        let mut master = pty.into_master().unwrap();
        let mut buf = [0u8; 2];
        master.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, payload);
    }
}

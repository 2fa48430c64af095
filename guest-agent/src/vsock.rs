//! Vsock listener with a TCP fallback for development kernels.
//!
//! tokio has no native AF_VSOCK support (mio's bookkeeping expects AF_UNIX /
//! AF_INET semantics), so the listener and accepted streams are raw fds
//! driven through `AsyncFd`.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::pin::Pin;
use std::task::Poll;

use anyhow::{bail, Context, Result};
use tokio::io::ReadBuf;
use tokio::net::TcpListener;
use tracing::{info, warn};

const AF_VSOCK: i32 = 40;

/// sockaddr_vm layout per include/uapi/linux/vm_sockets.h
#[repr(C)]
struct SockaddrVm {
    svm_family: u16,
    svm_reserved1: u16,
    svm_port: u32,
    svm_cid: u32,
    svm_flags: u8,
    svm_zero: [u8; 3],
}

pub enum Listener {
    Vsock(VsockListener),
    Tcp(TcpListener),
}

/// Bind a vsock listener; fall back to TCP on the same port when the guest
/// kernel has no vsock transport (useful for development hosts).
pub async fn listen(port: u32) -> Result<Listener> {
    match VsockListener::bind(port) {
        Ok(listener) => {
            info!(port, "listening on vsock");
            return Ok(Listener::Vsock(listener));
        }
        Err(e) => {
            warn!(error = %e, port, "vsock unavailable, falling back to TCP");
        }
    }

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind TCP fallback on {addr}"))?;
    info!(addr = %addr, "listening on TCP (fallback)");
    Ok(Listener::Tcp(listener))
}

/// A vsock listener built on raw syscalls and `AsyncFd`.
pub struct VsockListener {
    async_fd: tokio::io::unix::AsyncFd<OwnedFd>,
}

impl VsockListener {
    pub fn bind(port: u32) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                AF_VSOCK,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                0,
            )
        };
        if fd < 0 {
            bail!(
                "socket(AF_VSOCK) failed: {}",
                std::io::Error::last_os_error()
            );
        }

        let addr = SockaddrVm {
            svm_family: AF_VSOCK as u16,
            svm_reserved1: 0,
            svm_port: port,
            svm_cid: u32::MAX, // VMADDR_CID_ANY
            svm_flags: 0,
            svm_zero: [0; 3],
        };

        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const SockaddrVm as *const libc::sockaddr,
                std::mem::size_of::<SockaddrVm>() as u32,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            bail!("bind(vsock port {port}) failed: {err}");
        }

        let ret = unsafe { libc::listen(fd, 128) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            bail!("listen(vsock) failed: {err}");
        }

        let owned_fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let async_fd = tokio::io::unix::AsyncFd::new(owned_fd)?;
        Ok(Self { async_fd })
    }

    /// Accept a connection, returning the stream and the peer CID.
    pub async fn accept(&self) -> Result<(VsockStream, u32)> {
        loop {
            let mut guard = self.async_fd.readable().await?;

            match guard.try_io(|inner| {
                let client_fd = unsafe {
                    libc::accept4(
                        inner.get_ref().as_raw_fd(),
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                        libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                    )
                };
                if client_fd >= 0 {
                    Ok(client_fd)
                } else {
                    Err(std::io::Error::last_os_error())
                }
            }) {
                Ok(Ok(client_fd)) => {
                    let mut peer_addr: SockaddrVm = unsafe { std::mem::zeroed() };
                    let mut addr_len = std::mem::size_of::<SockaddrVm>() as u32;
                    unsafe {
                        libc::getpeername(
                            client_fd,
                            &mut peer_addr as *mut SockaddrVm as *mut libc::sockaddr,
                            &mut addr_len,
                        );
                    }

                    let owned = unsafe { OwnedFd::from_raw_fd(client_fd) };
                    let stream = VsockStream::new(owned)?;
                    return Ok((stream, peer_addr.svm_cid));
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

/// An accepted vsock connection with `AsyncRead`/`AsyncWrite` implemented
/// directly over `libc::read`/`libc::write`.
pub struct VsockStream {
    inner: tokio::io::unix::AsyncFd<OwnedFd>,
}

impl VsockStream {
    fn new(fd: OwnedFd) -> std::io::Result<Self> {
        let inner = tokio::io::unix::AsyncFd::new(fd)?;
        Ok(Self { inner })
    }
}

impl tokio::io::AsyncRead for VsockStream {
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
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl tokio::io::AsyncWrite for VsockStream {
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
        let fd = self.inner.get_ref().as_raw_fd();
        let ret = unsafe { libc::shutdown(fd, libc::SHUT_WR) };
        if ret == 0 {
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(std::io::Error::last_os_error()))
        }
    }
}

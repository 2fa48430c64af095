//! Command resolution and process spawning.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use vexec_protocol::ExecRequest;

use crate::pty::{Pty, PtyMaster};

/// PATH used when the agent's own environment does not carry one (the agent
/// may run as init in a minimal guest).
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Why a command path did not resolve to something runnable. Both variants
/// surface to the client as the exec-permission failure (exit 126).
#[derive(Debug, PartialEq, Eq)]
pub enum ResolveError {
    NotFound(String),
    NotExecutable(String),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::NotFound(cmd) => write!(f, "no such file or directory: {cmd}"),
            ResolveError::NotExecutable(path) => write!(f, "not an executable file: {path}"),
        }
    }
}

/// Resolve a command to an executable regular file.
///
/// Paths containing a slash are checked directly; bare names are searched on
/// PATH, skipping non-executable matches the way a shell does.
pub fn resolve_command(command: &str) -> Result<PathBuf, ResolveError> {
    if command.contains('/') {
        let path = PathBuf::from(command);
        return match check_executable(&path) {
            Ok(()) => Ok(path),
            Err(e) => Err(e),
        };
    }

    let search_path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
    for dir in search_path.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(command);
        if check_executable(&candidate).is_ok() {
            return Ok(candidate);
        }
    }
    Err(ResolveError::NotFound(command.to_string()))
}

fn check_executable(path: &Path) -> Result<(), ResolveError> {
    let display = path.display().to_string();
    let meta = std::fs::metadata(path).map_err(|_| ResolveError::NotFound(display.clone()))?;
    if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
        return Err(ResolveError::NotExecutable(display));
    }
    Ok(())
}

/// A spawned session child and the agent-side ends of its stdio.
pub struct Spawned {
    pub child: Child,
    pub io: ChildIo,
}

pub enum ChildIo {
    Pipes {
        stdin: Option<ChildStdin>,
        stdout: ChildStdout,
        stderr: ChildStderr,
    },
    Pty {
        master: PtyMaster,
    },
}

impl Spawned {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Spawn `resolved` according to the request: request environment merged
/// over the guest's base environment, optional working directory, and either
/// a PTY as controlling terminal (tty mode) or three plain pipes.
pub fn spawn(resolved: &Path, req: &ExecRequest) -> Result<Spawned> {
    let mut cmd = Command::new(resolved);
    cmd.args(&req.args);

    for (key, value) in &req.env {
        cmd.env(key, value);
    }
    if let Some(ref dir) = req.workdir {
        cmd.current_dir(dir);
    }

    // Backstop: if the connection task dies without cleanup, the kernel
    // still reaps the child.
    cmd.kill_on_drop(true);

    if req.tty {
        spawn_with_pty(cmd, req)
    } else {
        spawn_with_pipes(cmd)
    }
}

fn spawn_with_pipes(mut cmd: Command) -> Result<Spawned> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().context("spawn failed")?;
    let stdin = child.stdin.take();
    let stdout = child.stdout.take().context("child stdout missing")?;
    let stderr = child.stderr.take().context("child stderr missing")?;

    Ok(Spawned {
        child,
        io: ChildIo::Pipes {
            stdin,
            stdout,
            stderr,
        },
    })
}

fn spawn_with_pty(mut cmd: Command, req: &ExecRequest) -> Result<Spawned> {
    let pty = Pty::open()?;
    let slave_fd = pty.slave_fd();

    if !req.env.contains_key("TERM") {
        cmd.env("TERM", "xterm-256color");
    }

    // SAFETY: pre_exec runs after fork, before exec. Only async-signal-safe
    // calls: setsid, ioctl, dup2, close.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0
                || libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0
                || libc::dup2(slave_fd, libc::STDERR_FILENO) < 0
            {
                return Err(std::io::Error::last_os_error());
            }
            if slave_fd > libc::STDERR_FILENO {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    let child = cmd.spawn().context("spawn failed")?;
    let master = pty.into_master()?;

    Ok(Spawned {
        child,
        io: ChildIo::Pty { master },
    })
}

/// Map an exit status to the code reported to the client: the real exit
/// code, or 128+signal for a signal death.
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn request(command: &str, args: &[&str]) -> ExecRequest {
        ExecRequest {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            workdir: None,
            tty: false,
        }
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    #[test]
    fn test_resolve_absolute_path() {
        let path = resolve_command("/bin/sh").unwrap();
        assert_eq!(path, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_resolve_bare_name_on_path() {
        let path = resolve_command("sh").unwrap();
        assert!(path.ends_with("sh"));
    }

    #[test]
    fn test_resolve_missing_command() {
        let err = resolve_command("/no/such/binary-12345").unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));

        let err = resolve_command("no-such-binary-12345").unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }

    #[test]
    fn test_resolve_directory_is_not_executable() {
        let err = resolve_command("/etc").unwrap_err();
        assert!(matches!(err, ResolveError::NotExecutable(_)));
    }

    #[test]
    fn test_resolve_plain_file_without_exec_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "not a program").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = resolve_command(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ResolveError::NotExecutable(_)));
    }

    #[test]
    fn test_resolve_script_with_exec_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\nexit 0").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert!(resolve_command(path.to_str().unwrap()).is_ok());
    }

    // -----------------------------------------------------------------------
    // Spawning
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_spawn_reports_real_exit_code() {
        let req = request("/bin/sh", &["-c", "exit 42"]);
        let path = resolve_command(&req.command).unwrap();
        let mut spawned = spawn(&path, &req).unwrap();

        let status = spawned.child.wait().await.unwrap();
        assert_eq!(exit_code(status), 42);
    }

    #[tokio::test]
    async fn test_spawn_merges_env_over_base() {
        use tokio::io::AsyncReadExt;

        let mut req = request("/bin/sh", &["-c", "echo \"$VEXEC_TEST_FOO:$PATH\""]);
        req.env
            .insert("VEXEC_TEST_FOO".to_string(), "42".to_string());

        let path = resolve_command(&req.command).unwrap();
        let mut spawned = spawn(&path, &req).unwrap();

        let mut out = String::new();
        match &mut spawned.io {
            ChildIo::Pipes { stdout, .. } => {
                stdout.read_to_string(&mut out).await.unwrap();
            }
            ChildIo::Pty { .. } => unreachable!(),
        }
        let status = spawned.child.wait().await.unwrap();

        assert_eq!(exit_code(status), 0);
        // Override applied and the inherited environment preserved.
        assert!(out.starts_with("42:"));
        assert!(out.trim_end().len() > "42:".len());
    }

    #[tokio::test]
    async fn test_spawn_with_workdir() {
        use tokio::io::AsyncReadExt;

        let mut req = request("/bin/sh", &["-c", "pwd"]);
        req.workdir = Some("/tmp".to_string());

        let path = resolve_command(&req.command).unwrap();
        let mut spawned = spawn(&path, &req).unwrap();

        let mut out = String::new();
        if let ChildIo::Pipes { stdout, .. } = &mut spawned.io {
            stdout.read_to_string(&mut out).await.unwrap();
        }
        spawned.child.wait().await.unwrap();
        assert_eq!(out.trim_end(), "/tmp");
    }

    #[tokio::test]
    async fn test_spawn_tty_gives_child_a_terminal() {
        use tokio::io::AsyncReadExt;

        let mut req = request("/bin/sh", &["-c", "test -t 0 && test -t 1 && echo istty"]);
        req.tty = true;

        let path = resolve_command(&req.command).unwrap();
        let mut spawned = spawn(&path, &req).unwrap();

        let mut out = Vec::new();
        if let ChildIo::Pty { master } = &mut spawned.io {
            let mut buf = [0u8; 256];
            loop {
                match master.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => out.extend_from_slice(&buf[..n]),
                    Err(_) => break,
                }
            }
        } else {
            panic!("expected PTY io for tty request");
        }
        let status = spawned.child.wait().await.unwrap();

        assert_eq!(exit_code(status), 0);
        assert!(String::from_utf8_lossy(&out).contains("istty"));
    }
}

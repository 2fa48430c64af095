//! Local terminal handling for tty-mode sessions.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

/// RAII guard for raw mode: restores the terminal on drop, on every exit
/// path including errors and panics.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self> {
        enable_raw_mode().context("failed to enable raw mode")?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Whether local stdin is an actual terminal.
pub fn stdin_is_tty() -> bool {
    std::io::stdin().is_terminal()
}

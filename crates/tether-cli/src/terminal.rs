//! Local terminal state for interactive shells.

use anyhow::{Context, Result};
use crossterm::terminal;

/// Size assumed when the local terminal cannot report one.
pub const FALLBACK_SIZE: (u16, u16) = (80, 24);

/// Columns and rows of the local terminal.
pub fn size() -> (u16, u16) {
    terminal::size()
        .ok()
        .and_then(|(cols, rows)| usable(cols, rows))
        .unwrap_or(FALLBACK_SIZE)
}

fn usable(cols: u16, rows: u16) -> Option<(u16, u16)> {
    (cols > 0 && rows > 0).then_some((cols, rows))
}

/// Raw mode for as long as the value lives.
pub struct RawMode(());

impl RawMode {
    pub fn enter() -> Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
        Ok(Self(()))
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            tracing::warn!("could not restore terminal mode: {e}");
        }
    }
}

/// Last size sent to the remote shell. Terminals report the same size
/// several times while a window is dragged, and some report 0x0 while
/// minimized; neither is worth a window-change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeTracker {
    current: (u16, u16),
}

impl SizeTracker {
    pub fn new(initial: (u16, u16)) -> Self {
        Self { current: initial }
    }

    pub fn current(&self) -> (u16, u16) {
        self.current
    }

    /// Record a resize event. Returns the size to forward, if any.
    pub fn update(&mut self, cols: u16, rows: u16) -> Option<(u16, u16)> {
        let next = usable(cols, rows)?;
        if next == self.current {
            return None;
        }
        self.current = next;
        Some(next)
    }
}

//! `tether [user@]host`: open an interactive shell.
//!
//! Connects, starts a shell sized to the local terminal (over mosh when
//! configured), and enters raw mode to pipe the terminal to the remote
//! shell. Resize events are forwarded; `Ctrl+]` disconnects.

use std::io::Write;

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use tether_core::ShellTransport;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::ConnectOptions;
use crate::terminal as term;

/// Run an interactive shell against `target` ([user@]host).
pub async fn run(target: &str, opts: &ConnectOptions) -> Result<()> {
    let (client, key) = opts.connect(target).await?;

    let mut size = term::SizeTracker::new(term::size());
    let (cols, rows) = size.current();
    let mut shell = client
        .start_shell(cols, rows, None)
        .await
        .context("failed to start shell")?;
    info!(id = shell.id, cols, rows, transport = %shell.transport, "shell started");

    match (shell.transport, shell.fallback_reason) {
        (ShellTransport::MoshFallback, Some(reason)) => {
            eprintln!("tether: mosh unavailable ({reason}), using ssh");
        }
        (transport, _) => eprintln!("tether: connected to {key} over {transport}"),
    }

    let raw = term::RawMode::enter().context("failed to enter raw terminal mode")?;

    let (tx_input, mut rx_input) = mpsc::channel::<Vec<u8>>(64);
    let (tx_resize, mut rx_resize) = mpsc::channel::<(u16, u16)>(8);
    let (tx_quit, mut rx_quit) = mpsc::channel::<()>(1);

    // crossterm's event reader blocks, so it gets its own thread.
    let input_handle = tokio::task::spawn_blocking(move || loop {
        match event::read() {
            Ok(Event::Key(key_event)) => {
                // Ctrl+] disconnects, like telnet's escape.
                if key_event.modifiers.contains(KeyModifiers::CONTROL)
                    && key_event.code == KeyCode::Char(']')
                {
                    let _ = tx_quit.blocking_send(());
                    break;
                }
                if let Some(bytes) = key_event_to_bytes(&key_event) {
                    if tx_input.blocking_send(bytes).is_err() {
                        break;
                    }
                }
            }
            Ok(Event::Paste(text)) => {
                if tx_input.blocking_send(text.into_bytes()).is_err() {
                    break;
                }
            }
            Ok(Event::Resize(new_cols, new_rows)) => {
                let _ = tx_resize.blocking_send((new_cols, new_rows));
            }
            Ok(_) => {}
            Err(e) => {
                warn!("terminal event error: {e}");
                break;
            }
        }
    });

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            chunk = shell.output.recv() => match chunk {
                Some(bytes) => {
                    stdout.write_all(&bytes)?;
                    stdout.flush()?;
                }
                None => {
                    debug!("remote shell ended");
                    break;
                }
            },
            Some(bytes) = rx_input.recv() => {
                if let Err(e) = client.write(shell.id, &bytes).await {
                    warn!("write failed: {e}");
                    break;
                }
            }
            Some((c, r)) = rx_resize.recv() => {
                if let Some((c, r)) = size.update(c, r) {
                    debug!(cols = c, rows = r, "terminal resized");
                    if let Err(e) = client.resize(shell.id, c, r) {
                        warn!("resize failed: {e}");
                    }
                }
            }
            _ = rx_quit.recv() => {
                info!("disconnect requested");
                break;
            }
        }
    }

    input_handle.abort();
    client.disconnect().await;
    drop(raw);
    eprintln!("\r\nConnection to {} closed.", key.host);

    Ok(())
}

/// Convert a crossterm key event to the bytes a terminal would send.
fn key_event_to_bytes(event: &KeyEvent) -> Option<Vec<u8>> {
    let mut bytes = match event.code {
        KeyCode::Char(c) if event.modifiers.contains(KeyModifiers::CONTROL) => {
            match c.to_ascii_lowercase() {
                c @ 'a'..='z' => vec![c as u8 - b'a' + 1],
                ' ' | '@' | '2' => vec![0],
                '[' | '3' => vec![0x1b],
                '\\' | '4' => vec![0x1c],
                '^' | '6' => vec![0x1e],
                '_' | '-' | '7' => vec![0x1f],
                _ => return None,
            }
        }
        KeyCode::Char(c) => c.to_string().into_bytes(),
        KeyCode::Enter => vec![b'\r'],
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Tab => vec![b'\t'],
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Esc => vec![0x1b],
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Home => b"\x1b[H".to_vec(),
        KeyCode::End => b"\x1b[F".to_vec(),
        KeyCode::PageUp => b"\x1b[5~".to_vec(),
        KeyCode::PageDown => b"\x1b[6~".to_vec(),
        KeyCode::Insert => b"\x1b[2~".to_vec(),
        KeyCode::Delete => b"\x1b[3~".to_vec(),
        KeyCode::F(n) => {
            let seq: &[u8] = match n {
                1 => b"\x1bOP",
                2 => b"\x1bOQ",
                3 => b"\x1bOR",
                4 => b"\x1bOS",
                5 => b"\x1b[15~",
                6 => b"\x1b[17~",
                7 => b"\x1b[18~",
                8 => b"\x1b[19~",
                9 => b"\x1b[20~",
                10 => b"\x1b[21~",
                11 => b"\x1b[23~",
                12 => b"\x1b[24~",
                _ => return None,
            };
            seq.to_vec()
        }
        _ => return None,
    };

    // Alt sends an ESC prefix.
    if event.modifiers.contains(KeyModifiers::ALT) {
        bytes.insert(0, 0x1b);
    }
    Some(bytes)
}

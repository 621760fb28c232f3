//! `tether [user@]host command...`: one-off remote command execution.

use std::io::Write;

use anyhow::{Context, Result};
use tracing::info;

use super::ConnectOptions;

/// Execute a remote command and print its output.
pub async fn run(target: &str, command: &str, opts: &ConnectOptions) -> Result<()> {
    let (client, key) = opts.connect(target).await?;
    info!(remote = %key, command = %command, "exec");

    let result = client.execute(command).await;
    client.disconnect().await;

    let output = result.with_context(|| format!("command failed on {key}"))?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

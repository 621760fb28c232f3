//! `tether known-hosts`: inspect and edit the host trust store.

use std::path::Path;

use anyhow::{Context, Result};
use tether_client::TrustStore;
use tether_core::short_fingerprint;

/// Print every trusted host.
pub fn run_list(trust_path: &Path) -> Result<()> {
    let store = TrustStore::new(trust_path);
    let entries = store.list().context("failed to read trust store")?;
    if entries.is_empty() {
        println!("No known hosts in {}", trust_path.display());
        return Ok(());
    }

    for entry in entries {
        println!(
            "{}:{}  {}  {}  (first seen {}, last seen {})",
            entry.host,
            entry.port,
            entry.key_type,
            short_fingerprint(&entry.fingerprint),
            entry.added_at,
            entry.last_seen_at
        );
    }
    Ok(())
}

/// Forget a host so its next key is trusted afresh.
pub fn run_remove(trust_path: &Path, host: &str, port: u16) -> Result<()> {
    let store = TrustStore::new(trust_path);
    if store.remove(host, port).context("failed to update trust store")? {
        println!("Removed {host}:{port}");
    } else {
        println!("{host}:{port} is not a known host");
    }
    Ok(())
}

//! Trust-on-first-use (TOFU) host key store.
//!
//! Stores one entry per `host:port` at `~/.tether/known_hosts.json`.
//! A fingerprint is pinned the first time a host is seen; a later mismatch
//! is a hard failure and the stored entry is never overwritten implicitly.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tether_core::{TetherError, TetherResult};

/// A pinned host identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostKeyEntry {
    pub host: String,
    pub port: u16,
    pub fingerprint: String,
    pub key_type: String,
    /// Unix seconds when the host was first trusted.
    pub added_at: u64,
    /// Unix seconds of the last successful verification.
    pub last_seen_at: u64,
}

impl HostKeyEntry {
    /// A fresh entry stamped with the current time.
    pub fn new(host: &str, port: u16, fingerprint: &str, key_type: &str) -> Self {
        let now = unix_now();
        Self {
            host: host.to_string(),
            port,
            fingerprint: fingerprint.to_string(),
            key_type: key_type.to_string(),
            added_at: now,
            last_seen_at: now,
        }
    }

    fn store_key(&self) -> String {
        store_key(&self.host, self.port)
    }
}

/// Result of verifying a host's fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostStatus {
    /// The host is known and the fingerprint matches.
    Known,
    /// The host had never been seen and is now pinned.
    Added,
}

/// File-backed host key store. All access is serialized by one lock.
pub struct TrustStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TrustStore {
    /// Create a store backed by the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Create a store at the default location (`~/.tether/known_hosts.json`).
    pub fn default_location() -> TetherResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| TetherError::Config("cannot determine home directory".into()))?;
        Ok(Self::new(home.join(".tether").join("known_hosts.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up the pinned entry for `host:port`.
    pub fn lookup(&self, host: &str, port: u16) -> TetherResult<Option<HostKeyEntry>> {
        let _guard = self.guard()?;
        Ok(self.load_entries()?.remove(&store_key(host, port)))
    }

    /// Pin a new entry. Refuses to replace a different fingerprint.
    pub fn record_trusted(&self, entry: HostKeyEntry) -> TetherResult<()> {
        let _guard = self.guard()?;
        let mut entries = self.load_entries()?;
        if let Some(existing) = entries.get(&entry.store_key()) {
            if existing.fingerprint != entry.fingerprint {
                return Err(mismatch(&entry.host, entry.port, existing, &entry.fingerprint));
            }
        }
        entries.insert(entry.store_key(), entry);
        self.save_entries(&entries)
    }

    /// Refresh the last-seen timestamp of an existing entry.
    pub fn touch_last_seen(&self, host: &str, port: u16) -> TetherResult<()> {
        let _guard = self.guard()?;
        let mut entries = self.load_entries()?;
        if let Some(entry) = entries.get_mut(&store_key(host, port)) {
            entry.last_seen_at = unix_now();
            self.save_entries(&entries)?;
        }
        Ok(())
    }

    /// Verify a presented fingerprint, pinning it if the host is new.
    ///
    /// Lookup, record and refresh happen under one lock acquisition.
    pub fn verify(
        &self,
        host: &str,
        port: u16,
        fingerprint: &str,
        key_type: &str,
    ) -> TetherResult<HostStatus> {
        let _guard = self.guard()?;
        let mut entries = self.load_entries()?;
        let key = store_key(host, port);

        match entries.get_mut(&key) {
            Some(existing) if existing.fingerprint == fingerprint => {
                existing.last_seen_at = unix_now();
                self.save_entries(&entries)?;
                tracing::debug!(host = %key, "host key verified");
                Ok(HostStatus::Known)
            }
            Some(existing) => {
                tracing::warn!(
                    host = %key,
                    expected = %existing.fingerprint,
                    actual = %fingerprint,
                    "host key mismatch"
                );
                Err(mismatch(host, port, existing, fingerprint))
            }
            None => {
                tracing::info!(host = %key, fingerprint = %fingerprint, "trusting new host key");
                entries.insert(key, HostKeyEntry::new(host, port, fingerprint, key_type));
                self.save_entries(&entries)?;
                Ok(HostStatus::Added)
            }
        }
    }

    /// Remove the entry for `host:port`. Returns whether one existed.
    pub fn remove(&self, host: &str, port: u16) -> TetherResult<bool> {
        let _guard = self.guard()?;
        let mut entries = self.load_entries()?;
        let removed = entries.remove(&store_key(host, port)).is_some();
        if removed {
            self.save_entries(&entries)?;
        }
        Ok(removed)
    }

    /// All pinned entries, ordered by `host:port`.
    pub fn list(&self) -> TetherResult<Vec<HostKeyEntry>> {
        let _guard = self.guard()?;
        Ok(self.load_entries()?.into_values().collect())
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn guard(&self) -> TetherResult<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| TetherError::Unknown("trust store lock poisoned".into()))
    }

    fn load_entries(&self) -> TetherResult<BTreeMap<String, HostKeyEntry>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            TetherError::Config(format!("corrupt known hosts file {}: {e}", self.path.display()))
        })
    }

    fn save_entries(&self, entries: &BTreeMap<String, HostKeyEntry>) -> TetherResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
                }
            }
        }

        let content = serde_json::to_string_pretty(entries)
            .map_err(|e| TetherError::Unknown(format!("failed to encode known hosts: {e}")))?;
        fs::write(&self.path, content + "\n")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

fn store_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

fn mismatch(host: &str, port: u16, existing: &HostKeyEntry, actual: &str) -> TetherError {
    TetherError::HostKeyVerificationFailed {
        host: store_key(host, port),
        expected: existing.fingerprint.clone(),
        actual: actual.to_string(),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

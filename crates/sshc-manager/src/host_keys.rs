//! Trust-on-first-use host-key store.
//!
//! A simple persistent map `instance -> fingerprint` under the data
//! directory. The first connection to an instance records its host key
//! fingerprint; every later connection must match it exactly. This store
//! fails closed on mismatch — it never silently re-pins.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sshc_core::instance::InstanceId;

const HOST_KEYS_FILE: &str = "known_hosts.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyOutcome {
    /// No prior fingerprint; this one was recorded.
    FirstUse,
    /// Matched the previously recorded fingerprint.
    Matched,
    /// Did not match; connection must be rejected.
    Mismatch,
}

#[derive(Default, Serialize, Deserialize)]
struct HostKeyFile {
    #[serde(flatten)]
    entries: HashMap<String, String>,
}

/// Persistent TOFU pinning of per-instance SSH host-key fingerprints.
pub struct HostKeyStore {
    path: PathBuf,
    entries: RwLock<HashMap<InstanceId, String>>,
}

impl HostKeyStore {
    pub fn load(data_dir: &Path) -> Result<Self, std::io::Error> {
        let path = data_dir.join(HOST_KEYS_FILE);
        let entries = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let file: HostKeyFile = serde_json::from_str(&content).unwrap_or_default();
            file.entries
                .into_iter()
                .filter_map(|(k, v)| k.parse::<u64>().ok().map(|id| (InstanceId(id), v)))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Check `fingerprint` against the pinned value for `instance`, pinning
    /// it if this is the first connection.
    pub fn check_or_pin(&self, instance: InstanceId, fingerprint: &str) -> HostKeyOutcome {
        let mut guard = self.entries.write();
        match guard.get(&instance) {
            Some(pinned) if pinned == fingerprint => HostKeyOutcome::Matched,
            Some(_) => HostKeyOutcome::Mismatch,
            None => {
                guard.insert(instance, fingerprint.to_string());
                let snapshot: HashMap<String, String> = guard
                    .iter()
                    .map(|(id, fp)| (id.0.to_string(), fp.clone()))
                    .collect();
                drop(guard);
                let _ = self.persist(&snapshot);
                HostKeyOutcome::FirstUse
            }
        }
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<(), std::io::Error> {
        let file = HostKeyFile {
            entries: entries.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        let tmp_path = self.path.with_extension(format!("tmp-{}", std::process::id()));
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn forget(&self, instance: InstanceId) {
        let mut guard = self.entries.write();
        guard.remove(&instance);
        let snapshot: HashMap<String, String> = guard
            .iter()
            .map(|(id, fp)| (id.0.to_string(), fp.clone()))
            .collect();
        drop(guard);
        let _ = self.persist(&snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_connection_pins_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = HostKeyStore::load(dir.path()).unwrap();

        assert_eq!(
            store.check_or_pin(InstanceId(1), "SHA256:abc"),
            HostKeyOutcome::FirstUse
        );

        let reloaded = HostKeyStore::load(dir.path()).unwrap();
        assert_eq!(
            reloaded.check_or_pin(InstanceId(1), "SHA256:abc"),
            HostKeyOutcome::Matched
        );
    }

    #[test]
    fn mismatched_fingerprint_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let store = HostKeyStore::load(dir.path()).unwrap();

        store.check_or_pin(InstanceId(1), "SHA256:abc");
        assert_eq!(
            store.check_or_pin(InstanceId(1), "SHA256:xyz"),
            HostKeyOutcome::Mismatch
        );
    }

    #[test]
    fn forget_allows_repinning() {
        let dir = tempfile::tempdir().unwrap();
        let store = HostKeyStore::load(dir.path()).unwrap();

        store.check_or_pin(InstanceId(1), "SHA256:abc");
        store.forget(InstanceId(1));
        assert_eq!(
            store.check_or_pin(InstanceId(1), "SHA256:xyz"),
            HostKeyOutcome::FirstUse
        );
    }

    #[test]
    fn distinct_instances_pin_independently() {
        let dir = tempfile::tempdir().unwrap();
        let store = HostKeyStore::load(dir.path()).unwrap();

        store.check_or_pin(InstanceId(1), "SHA256:abc");
        assert_eq!(
            store.check_or_pin(InstanceId(2), "SHA256:abc"),
            HostKeyOutcome::FirstUse
        );
    }
}

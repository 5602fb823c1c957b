//! Durable record of which sandboxes exist.
//!
//! The whole file is rewritten on every mutation through a temp file in the same
//! directory followed by an atomic rename, so readers only ever see a complete
//! old or new version. Read-modify-write cycles hold `registry.lock`.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use crate::config::PortRange;
use crate::error::{SandboxError, detail};
use crate::{lock, port};

const REGISTRY_FILE: &str = "registry.json";
const REGISTRY_LOCK: &str = "registry.lock";

/// Persisted health flag. Only `degraded` is ever written out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Live,
    Degraded,
}

impl EntryStatus {
    fn is_live(&self) -> bool {
        matches!(self, EntryStatus::Live)
    }
}

/// Registry entry for one sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub port: u16,
    /// Root of checkout, install prefix and data directory
    pub path: PathBuf,
    /// Registration time, UNIX seconds
    #[serde(deserialize_with = "epoch_seconds")]
    pub started: u64,
    #[serde(default, skip_serializing_if = "EntryStatus::is_live")]
    pub status: EntryStatus,
}

impl SandboxInfo {
    pub fn is_degraded(&self) -> bool {
        self.status == EntryStatus::Degraded
    }
}

/// Older registries stored fractional seconds.
fn epoch_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Ok(if secs.is_finite() && secs > 0.0 {
        secs as u64
    } else {
        0
    })
}

pub type Entries = BTreeMap<String, SandboxInfo>;

/// Handle on the registry file inside a state directory.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl Registry {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(REGISTRY_FILE),
            lock_path: state_dir.join(REGISTRY_LOCK),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot. A missing or unreadable file is an empty registry.
    pub fn list(&self) -> Entries {
        match self.load() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.path.display(), error = %detail(&e), "registry:unreadable, treating as empty");
                Entries::new()
            }
        }
    }

    pub fn get(&self, label: &str) -> Option<SandboxInfo> {
        self.list().remove(label)
    }

    /// Insert or overwrite the entry for `label`, stamped with the current time.
    ///
    /// Refuses a port that another label already holds.
    pub fn add(&self, label: &str, port: u16, path: &Path) -> Result<(), SandboxError> {
        self.update(|entries| {
            if let Some((other, _)) = entries
                .iter()
                .find(|(other, info)| other.as_str() != label && info.port == port)
            {
                return Err(format!("port {port} is already registered to '{other}'"));
            }
            entries.insert(
                label.to_string(),
                SandboxInfo {
                    port,
                    path: path.to_path_buf(),
                    started: now_secs(),
                    status: EntryStatus::Live,
                },
            );
            Ok(())
        })?;
        info!(label, port, path = %path.display(), "registry:added");
        Ok(())
    }

    /// Drop the entry for `label`. Absent labels are a no-op.
    pub fn remove(&self, label: &str) -> Result<Option<SandboxInfo>, SandboxError> {
        let removed = self.update(|entries| Ok(entries.remove(label)))?;
        if removed.is_some() {
            info!(label, "registry:removed");
        }
        Ok(removed)
    }

    /// Change the persisted status of an existing entry. Returns false if absent.
    pub fn set_status(&self, label: &str, status: EntryStatus) -> Result<bool, SandboxError> {
        let found = self.update(|entries| {
            Ok(match entries.get_mut(label) {
                Some(info) => {
                    info.status = status;
                    true
                }
                None => false,
            })
        })?;
        if found {
            info!(label, ?status, "registry:status");
        }
        Ok(found)
    }

    /// Pick a port no registered sandbox uses.
    pub fn allocate_port(&self, range: PortRange) -> Result<u16, SandboxError> {
        let taken: HashSet<u16> = self.list().values().map(|info| info.port).collect();
        let port = port::next_free_port(&taken, range)?;
        debug!(port, taken = taken.len(), "registry:port allocated");
        Ok(port)
    }

    fn update<T>(
        &self,
        mutate: impl FnOnce(&mut Entries) -> std::result::Result<T, String>,
    ) -> Result<T, SandboxError> {
        let _guard = lock::lock_exclusive(&self.lock_path).map_err(|e| self.error(&e))?;
        let mut entries = self.list();
        let value = mutate(&mut entries).map_err(|msg| SandboxError::Registry {
            path: self.path.clone(),
            detail: msg,
        })?;
        self.save(&entries).map_err(|e| self.error(&e))?;
        Ok(value)
    }

    fn load(&self) -> Result<Entries> {
        if !self.path.exists() {
            return Ok(Entries::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if contents.trim().is_empty() {
            return Ok(Entries::new());
        }
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    fn save(&self, entries: &Entries) -> Result<()> {
        let dir = self
            .path
            .parent()
            .context("Registry path has no parent directory")?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory {}", dir.display()))?;

        let json = serde_json::to_string_pretty(entries).context("Failed to serialize registry")?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(json.as_bytes())
            .context("Failed to write registry temp file")?;
        tmp.as_file()
            .sync_all()
            .context("Failed to sync registry temp file")?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn error(&self, err: &anyhow::Error) -> SandboxError {
        SandboxError::Registry {
            path: self.path.clone(),
            detail: detail(err),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, Registry) {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Registry::new(tmp.path());
        (tmp, registry)
    }

    #[test]
    fn missing_file_is_empty() {
        let (_tmp, registry) = registry();
        assert!(registry.list().is_empty());
        assert!(registry.get("alpha").is_none());
    }

    #[test]
    fn malformed_file_is_empty() {
        let (_tmp, registry) = registry();
        fs::write(registry.path(), "{ not json").unwrap();
        assert!(registry.list().is_empty());

        // The next write replaces the broken file
        registry.add("alpha", 58000, Path::new("/tmp/alpha")).unwrap();
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn add_and_remove_instance() {
        let (_tmp, registry) = registry();
        registry.add("foo", 58000, Path::new("/tmp/foo")).unwrap();
        let data = registry.list();
        assert_eq!(data["foo"].port, 58000);
        assert_eq!(data["foo"].path, PathBuf::from("/tmp/foo"));
        assert!(data["foo"].started > 0);

        let removed = registry.remove("foo").unwrap();
        assert_eq!(removed.map(|i| i.port), Some(58000));
        assert!(!registry.list().contains_key("foo"));
    }

    #[test]
    fn remove_absent_is_noop() {
        let (_tmp, registry) = registry();
        assert!(registry.remove("ghost").unwrap().is_none());
    }

    #[test]
    fn add_upserts_same_label() {
        let (_tmp, registry) = registry();
        registry.add("alpha", 58000, Path::new("/a")).unwrap();
        registry.add("alpha", 58001, Path::new("/b")).unwrap();
        let info = registry.get("alpha").unwrap();
        assert_eq!(info.port, 58001);
        assert_eq!(info.path, PathBuf::from("/b"));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn add_rejects_port_held_by_other_label() {
        let (_tmp, registry) = registry();
        registry.add("alpha", 58000, Path::new("/a")).unwrap();
        let err = registry.add("beta", 58000, Path::new("/b")).unwrap_err();
        assert!(matches!(err, SandboxError::Registry { .. }));
        assert!(registry.get("beta").is_none());
    }

    #[test]
    fn degraded_status_round_trips_and_live_is_omitted() {
        let (_tmp, registry) = registry();
        registry.add("alpha", 58000, Path::new("/a")).unwrap();
        let raw = fs::read_to_string(registry.path()).unwrap();
        assert!(!raw.contains("status"));

        assert!(registry.set_status("alpha", EntryStatus::Degraded).unwrap());
        assert!(registry.get("alpha").unwrap().is_degraded());
        assert!(!registry.set_status("ghost", EntryStatus::Degraded).unwrap());
    }

    #[test]
    fn reads_fractional_started_timestamps() {
        let (_tmp, registry) = registry();
        fs::write(
            registry.path(),
            r#"{"foo": {"port": 58000, "path": "/tmp/foo", "started": 1718000000.75}}"#,
        )
        .unwrap();
        let info = registry.get("foo").unwrap();
        assert_eq!(info.started, 1718000000);
        assert_eq!(info.status, EntryStatus::Live);
    }

    #[test]
    fn writes_leave_no_temp_files() {
        let (tmp, registry) = registry();
        for i in 0..5 {
            registry
                .add(&format!("s{i}"), 58000 + i, Path::new("/x"))
                .unwrap();
        }
        let stray: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n != REGISTRY_FILE && n != REGISTRY_LOCK)
            .collect();
        assert!(stray.is_empty(), "unexpected files: {stray:?}");
    }

    #[test]
    fn allocate_port_avoids_registered_ports() {
        let (_tmp, registry) = registry();
        let range = PortRange { min: 56000, max: 56002 };
        registry.add("a", 56000, Path::new("/a")).unwrap();
        registry.add("b", 56001, Path::new("/b")).unwrap();
        assert_eq!(registry.allocate_port(range).unwrap(), 56002);
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let (_tmp, registry) = registry();
        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .add(&format!("s{i}"), 57000 + i, Path::new("/x"))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.list().len(), 8);
    }
}

//! Advisory file locks.
//!
//! Per-label locks keep two provisioning or patch runs from interleaving on the
//! same sandbox, across threads and across separate `pgsandbox` processes.
//! The registry lock serializes read-modify-write cycles on the registry file.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, trace};

use crate::error::SandboxError;

/// Exclusive hold on one sandbox label. Released on drop.
#[derive(Debug)]
pub struct LabelLock {
    label: String,
    _lock: Flock<File>,
}

impl LabelLock {
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for LabelLock {
    fn drop(&mut self) {
        trace!(label = self.label(), "lock:released");
    }
}

/// Take the lock for `label` without waiting. Contention yields `SandboxError::Busy`.
pub fn try_lock_label(locks_dir: &Path, label: &str) -> Result<LabelLock, SandboxError> {
    let path = locks_dir.join(lock_file_name(label));
    let file = open_lock_file(&path).map_err(|e| SandboxError::Registry {
        path: path.clone(),
        detail: crate::error::detail(&e),
    })?;

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => {
            debug!(label, "lock:acquired");
            Ok(LabelLock {
                label: label.to_string(),
                _lock: lock,
            })
        }
        Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
            debug!(label, "lock:busy");
            Err(SandboxError::Busy(label.to_string()))
        }
        Err((_, errno)) => Err(SandboxError::Registry {
            path,
            detail: format!("flock failed: {errno}"),
        }),
    }
}

/// Block until an exclusive lock on `path` is held.
pub fn lock_exclusive(path: &Path) -> Result<Flock<File>> {
    let file = open_lock_file(path)?;
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| anyhow!("Failed to lock {}: {}", path.display(), errno))
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create lock directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open lock file {}", path.display()))
}

/// `<label>.lock` for plain labels. Anything else (labels from older registries
/// may contain spaces or slashes) is hex-encoded behind a `~`, which plain
/// labels never contain, so the file always lands directly in the locks dir.
fn lock_file_name(label: &str) -> String {
    let plain = label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !label.is_empty()
        && !label.starts_with('.');
    if plain {
        format!("{label}.lock")
    } else {
        let hex: String = label.bytes().map(|b| format!("{b:02x}")).collect();
        format!("~{hex}.lock")
    }
}

/// Directory holding the per-label lock files
pub fn locks_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("locks")
}

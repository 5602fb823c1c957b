use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Result of provisioning a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provisioned {
    pub label: String,
    pub port: u16,
    pub path: PathBuf,
}

/// A usable sandbox handed out by `ensure`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Acquired {
    pub label: String,
    pub port: u16,
    pub path: PathBuf,
    /// True when no live sandbox existed and a new one was built
    pub provisioned: bool,
}

/// Result of a committed patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchReport {
    pub label: String,
    pub port: u16,
    pub previous_revision: String,
    pub revision: String,
}

/// Result of stopping one sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub label: String,
    pub port: u16,
    /// False when the server was already down
    pub was_running: bool,
    pub purged: bool,
}

/// Health of a registered sandbox, derived from its entry and a live probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Live,
    Unreachable,
    /// Rollback failed; unusable until an operator stops it
    Degraded,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Health::Live => "live",
            Health::Unreachable => "unreachable",
            Health::Degraded => "degraded",
        })
    }
}

/// Patch engine states, in order.
///
/// `RollingBack` is reachable from any state from `Stopping` onward and ends in
/// `RolledBack` or `Degraded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchState {
    Validating,
    Stopping,
    Applying,
    Rebuilding,
    Restarting,
    Committed,
    RollingBack,
    RolledBack,
    Degraded,
}

impl PatchState {
    /// Once past validation the running server may no longer match the tree.
    pub fn is_past_point_of_no_return(&self) -> bool {
        !matches!(self, PatchState::Validating)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PatchState::Committed | PatchState::RolledBack | PatchState::Degraded
        )
    }
}

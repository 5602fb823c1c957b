mod postgres;

use anyhow::Result;
use std::path::{Path, PathBuf};

pub use self::postgres::PostgresToolchain;

/// On-disk layout of one sandbox, derived from its root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLayout {
    /// Source checkout; also the build directory
    pub root: PathBuf,
}

impl SandboxLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `--prefix` handed to configure
    pub fn prefix(&self) -> PathBuf {
        self.root.join("install")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.prefix().join("bin")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn server_log(&self) -> PathBuf {
        self.root.join("server.log")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// How hard to stop a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Disconnect clients and shut down cleanly
    Fast,
    /// Abort without a shutdown checkpoint
    Immediate,
}

/// Every external action the lifecycle engine needs.
///
/// The production implementation shells out to git, make and the server's
/// admin tools. Each call blocks until the step finishes or times out.
pub trait Toolchain: Send + Sync {
    /// Make sure the programs this toolchain shells out to exist
    fn preflight(&self) -> Result<()>;

    // ── Provisioning ────────────────────────────────────────────────

    /// Shallow-clone the sources into `layout.root` (which must be empty)
    fn fetch(&self, layout: &SandboxLayout) -> Result<()>;

    fn configure(&self, layout: &SandboxLayout) -> Result<()>;

    fn build(&self, layout: &SandboxLayout) -> Result<()>;

    fn install(&self, layout: &SandboxLayout) -> Result<()>;

    /// Create an empty data directory with trust authentication
    fn init_storage(&self, layout: &SandboxLayout) -> Result<()>;

    // ── Server control ──────────────────────────────────────────────

    fn start(&self, layout: &SandboxLayout, port: u16) -> Result<()>;

    fn stop(&self, layout: &SandboxLayout, mode: StopMode) -> Result<()>;

    // ── Source tree ─────────────────────────────────────────────────

    /// Revision currently checked out
    fn head_revision(&self, layout: &SandboxLayout) -> Result<String>;

    /// Paths with edits that are not part of `head_revision`. Sandbox-local
    /// build products and data are not reported.
    fn uncommitted_changes(&self, layout: &SandboxLayout) -> Result<Vec<String>>;

    /// Dry-run: would `patch` apply to the working tree?
    fn check_patch(&self, layout: &SandboxLayout, patch: &Path) -> Result<()>;

    fn apply_patch(&self, layout: &SandboxLayout, patch: &Path) -> Result<()>;

    /// Record the working tree as a new revision
    fn commit(&self, layout: &SandboxLayout, message: &str) -> Result<()>;

    /// Force the working tree back to `revision`, dropping untracked sources
    fn reset(&self, layout: &SandboxLayout, revision: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_hang_off_root() {
        let layout = SandboxLayout::new("/tmp/pgdbg_alpha");
        assert_eq!(layout.prefix(), PathBuf::from("/tmp/pgdbg_alpha/install"));
        assert_eq!(layout.bin_dir(), PathBuf::from("/tmp/pgdbg_alpha/install/bin"));
        assert_eq!(layout.data_dir(), PathBuf::from("/tmp/pgdbg_alpha/data"));
        assert_eq!(layout.server_log(), PathBuf::from("/tmp/pgdbg_alpha/server.log"));
    }
}

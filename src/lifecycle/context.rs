use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::types::Health;
use crate::config::Config;
use crate::error::{SandboxError, Step, detail};
use crate::lock::{self, LabelLock};
use crate::probe::{self, PgProber, Prober};
use crate::registry::{Registry, SandboxInfo};
use crate::toolchain::{PostgresToolchain, SandboxLayout, Toolchain};

/// Everything a lifecycle operation needs, passed explicitly to each call.
///
/// There is no process-wide "current sandbox"; callers name the label they
/// operate on and get port and path back.
pub struct SandboxContext {
    pub config: Config,
    pub registry: Registry,
    pub toolchain: Arc<dyn Toolchain>,
    pub prober: Arc<dyn Prober>,
    locks_dir: PathBuf,
}

impl SandboxContext {
    /// Production context: real toolchain, wire-protocol prober, configured state dir.
    pub fn new(config: Config) -> Self {
        let state_dir = config.state_dir();
        let toolchain = Arc::new(PostgresToolchain::new(&config));
        let prober = Arc::new(PgProber::new(&config.probe));
        Self::with_backends(config, &state_dir, toolchain, prober)
    }

    pub fn with_backends(
        config: Config,
        state_dir: &Path,
        toolchain: Arc<dyn Toolchain>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let registry = Registry::new(state_dir);
        debug!(registry = %registry.path().display(), "sandbox_context:created");
        Self {
            config,
            registry,
            toolchain,
            prober,
            locks_dir: lock::locks_dir(state_dir),
        }
    }

    /// Exclusive hold on `label` for the duration of one operation.
    pub fn lock(&self, label: &str) -> Result<LabelLock, SandboxError> {
        lock::try_lock_label(&self.locks_dir, label)
    }

    /// Probe-derived health; degraded entries never report live.
    pub fn health(&self, info: &SandboxInfo) -> Health {
        if info.is_degraded() {
            Health::Degraded
        } else if self.prober.is_alive(info.port) {
            Health::Live
        } else {
            Health::Unreachable
        }
    }

    /// Health of a label, or None if it is not registered.
    pub fn health_of(&self, label: &str) -> Option<Health> {
        self.registry.get(label).map(|info| self.health(&info))
    }

    /// Source tree for read-only inspection tools.
    ///
    /// An explicit override wins. Otherwise the named sandbox, or the first live
    /// one when no label is given.
    pub fn source_root(
        &self,
        override_root: Option<PathBuf>,
        label: Option<&str>,
    ) -> Result<PathBuf, SandboxError> {
        if let Some(root) = override_root {
            return Ok(root);
        }
        match label {
            Some(label) => self
                .registry
                .get(label)
                .map(|info| info.path)
                .ok_or_else(|| SandboxError::NotFound(label.to_string())),
            None => self
                .registry
                .list()
                .into_values()
                .find(|info| self.health(info) == Health::Live)
                .map(|info| info.path)
                .ok_or_else(|| SandboxError::NotFound("<any live sandbox>".to_string())),
        }
    }

    /// Build and install the current tree into the existing prefix.
    pub(super) fn rebuild(&self, label: &str, layout: &SandboxLayout) -> Result<(), SandboxError> {
        self.toolchain
            .build(layout)
            .map_err(|e| build_error(label, Step::Build, &e))?;
        self.toolchain
            .install(layout)
            .map_err(|e| build_error(label, Step::Install, &e))?;
        Ok(())
    }

    /// Start the server and wait until it answers probes on `port`.
    pub(super) fn start_server(
        &self,
        label: &str,
        layout: &SandboxLayout,
        port: u16,
    ) -> Result<(), SandboxError> {
        self.toolchain
            .start(layout, port)
            .map_err(|e| runtime_error(label, Step::Start, &e))?;
        if !probe::wait_until_alive(self.prober.as_ref(), port, &self.config.probe) {
            return Err(SandboxError::Runtime {
                label: label.to_string(),
                step: Step::Start,
                detail: format!("server did not answer on port {port} after start"),
            });
        }
        Ok(())
    }
}

pub(super) fn build_error(label: &str, step: Step, err: &anyhow::Error) -> SandboxError {
    SandboxError::Build {
        label: label.to_string(),
        step,
        detail: detail(err),
    }
}

pub(super) fn runtime_error(label: &str, step: Step, err: &anyhow::Error) -> SandboxError {
    SandboxError::Runtime {
        label: label.to_string(),
        step,
        detail: detail(err),
    }
}

//! Apply a unified diff to a live sandbox, rebuild, and restart it on the same port.
//!
//! Runs strictly in order: validate, stop, apply, rebuild, restart. A failure
//! after the server has been stopped resets the tree to the revision recorded
//! during validation, rebuilds and restarts it. If that recovery fails too, the
//! sandbox is stopped and flagged degraded in the registry.

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use tracing::{debug, error, info, warn};

use super::context::{SandboxContext, build_error, runtime_error};
use super::types::{PatchReport, PatchState};
use crate::error::{SandboxError, Step, detail};
use crate::registry::EntryStatus;
use crate::toolchain::{SandboxLayout, StopMode};

/// Apply `patch` (unified diff text) to the sandbox `label`.
///
/// `patch_name` only labels the commit that records the change.
/// Any error means the patch did not take effect; on `RolledBack` the sandbox is
/// running its previous version, on `RollbackFailure` it is degraded.
pub fn apply_patch(
    ctx: &SandboxContext,
    label: &str,
    patch: &str,
    patch_name: &str,
) -> Result<PatchReport, SandboxError> {
    let _lock = ctx.lock(label)?;

    let info = ctx
        .registry
        .get(label)
        .ok_or_else(|| SandboxError::NotFound(label.to_string()))?;
    if info.is_degraded() {
        return Err(SandboxError::Degraded(label.to_string()));
    }
    if !ctx.prober.is_alive(info.port) {
        return Err(SandboxError::Unreachable {
            label: label.to_string(),
            port: info.port,
        });
    }

    let mut run = PatchRun {
        ctx,
        label,
        layout: SandboxLayout::new(&info.path),
        port: info.port,
        state: PatchState::Validating,
    };
    let result = run.execute(patch, patch_name);
    debug_assert!(run.state.is_terminal() || result.is_err());
    result
}

struct PatchRun<'a> {
    ctx: &'a SandboxContext,
    label: &'a str,
    layout: SandboxLayout,
    port: u16,
    state: PatchState,
}

impl PatchRun<'_> {
    fn transition(&mut self, next: PatchState) {
        info!(label = self.label, from = ?self.state, to = ?next, "patch:state");
        self.state = next;
    }

    fn execute(&mut self, patch: &str, patch_name: &str) -> Result<PatchReport, SandboxError> {
        // Validating: nothing below mutates the sandbox
        if patch.trim().is_empty() {
            return Err(self.validation("patch is empty".to_string()));
        }
        // Rollback resets to the recorded revision, which would discard hand edits
        let dirty = self
            .ctx
            .toolchain
            .uncommitted_changes(&self.layout)
            .map_err(|e| runtime_error(self.label, Step::Check, &e))?;
        if !dirty.is_empty() {
            return Err(self.validation(format!(
                "sandbox tree has uncommitted changes ({}); commit or discard them first",
                dirty.join(", ")
            )));
        }
        let patch_file = stage_patch(self.label, &std::env::temp_dir(), patch)?;
        self.ctx
            .toolchain
            .check_patch(&self.layout, patch_file.path())
            .map_err(|e| self.validation(detail(&e)))?;
        let base = self
            .ctx
            .toolchain
            .head_revision(&self.layout)
            .map_err(|e| runtime_error(self.label, Step::Check, &e))?;
        debug!(label = self.label, base = %base, "patch:validated");

        self.transition(PatchState::Stopping);
        if let Err(e) = self.ctx.toolchain.stop(&self.layout, StopMode::Fast) {
            let cause = runtime_error(self.label, Step::Stop, &e);
            if self.ctx.prober.is_alive(self.port) {
                // Still serving the untouched tree; nothing to undo
                warn!(label = self.label, "patch:stop failed, server still running");
                return Err(cause);
            }
            return self.roll_back(&base, cause);
        }

        self.transition(PatchState::Applying);
        if let Err(e) = self.ctx.toolchain.apply_patch(&self.layout, patch_file.path()) {
            return self.roll_back(&base, build_error(self.label, Step::Apply, &e));
        }
        let message = format!("pgsandbox: apply {patch_name}");
        if let Err(e) = self.ctx.toolchain.commit(&self.layout, &message) {
            return self.roll_back(&base, build_error(self.label, Step::Commit, &e));
        }

        self.transition(PatchState::Rebuilding);
        if let Err(cause) = self.ctx.rebuild(self.label, &self.layout) {
            return self.roll_back(&base, cause);
        }

        self.transition(PatchState::Restarting);
        if let Err(cause) = self.ctx.start_server(self.label, &self.layout, self.port) {
            return self.roll_back(&base, cause);
        }

        let revision = self
            .ctx
            .toolchain
            .head_revision(&self.layout)
            .unwrap_or_else(|_| "unknown".to_string());
        self.transition(PatchState::Committed);
        info!(label = self.label, port = self.port, %revision, "patch:committed");
        Ok(PatchReport {
            label: self.label.to_string(),
            port: self.port,
            previous_revision: base,
            revision,
        })
    }

    /// Restore `base`, rebuild and restart. Always returns an error.
    fn roll_back(&mut self, base: &str, cause: SandboxError) -> Result<PatchReport, SandboxError> {
        debug_assert!(self.state.is_past_point_of_no_return());
        warn!(label = self.label, error = %cause, "patch:failed, rolling back");
        self.transition(PatchState::RollingBack);

        // The failed build may have come up without answering probes
        if let Err(e) = self.ctx.toolchain.stop(&self.layout, StopMode::Immediate) {
            debug!(label = self.label, error = %detail(&e), "patch:rollback stop (server already down)");
        }

        if let Err(e) = self.ctx.toolchain.reset(&self.layout, base) {
            return self.degrade(cause, Step::Reset, detail(&e));
        }
        if let Err(e) = self.ctx.rebuild(self.label, &self.layout) {
            let step = e.step().unwrap_or(Step::Build);
            return self.degrade(cause, step, e.to_string());
        }
        if let Err(e) = self.ctx.start_server(self.label, &self.layout, self.port) {
            return self.degrade(cause, Step::Start, e.to_string());
        }

        self.transition(PatchState::RolledBack);
        info!(label = self.label, port = self.port, base, "patch:rolled back");
        Err(SandboxError::RolledBack {
            label: self.label.to_string(),
            cause: Box::new(cause),
        })
    }

    /// Recovery failed: leave the server stopped and flag the entry.
    fn degrade(
        &mut self,
        cause: SandboxError,
        step: Step,
        failure: String,
    ) -> Result<PatchReport, SandboxError> {
        self.transition(PatchState::Degraded);
        error!(label = self.label, %step, error = %failure, "patch:rollback failed, sandbox degraded");

        let _ = self.ctx.toolchain.stop(&self.layout, StopMode::Immediate);
        match self.ctx.registry.set_status(self.label, EntryStatus::Degraded) {
            Ok(_) => {}
            Err(e) => error!(label = self.label, error = %e, "patch:could not flag degraded"),
        }

        Err(SandboxError::RollbackFailure {
            label: self.label.to_string(),
            step,
            cause: Box::new(cause),
            detail: failure,
        })
    }

    fn validation(&self, detail: String) -> SandboxError {
        SandboxError::Validation {
            label: self.label.to_string(),
            detail,
        }
    }
}

/// Write the patch to a temp file under `dir` for git to read.
fn stage_patch(
    label: &str,
    dir: &Path,
    patch: &str,
) -> Result<tempfile::NamedTempFile, SandboxError> {
    write_patch_file(dir, patch).map_err(|e| SandboxError::Staging {
        label: label.to_string(),
        detail: detail(&e),
    })
}

fn write_patch_file(dir: &Path, patch: &str) -> anyhow::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("pgsandbox-")
        .suffix(".diff")
        .tempfile_in(dir)
        .with_context(|| format!("Failed to create patch temp file in {}", dir.display()))?;
    file.write_all(patch.as_bytes())
        .context("Failed to write patch temp file")?;
    if !patch.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(file)
}

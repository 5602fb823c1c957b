use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{error, info, warn};

use super::context::{SandboxContext, build_error, runtime_error};
use super::types::Provisioned;
use super::validate_label;
use crate::error::{SandboxError, Step, detail};
use crate::toolchain::{SandboxLayout, StopMode};

const WORKDIR_PREFIX: &str = "pgdbg_";

/// Clone, build, install, initialize, start and register a new sandbox.
///
/// The registry entry is written last. If any earlier step fails the label is
/// not registered and the working directory stays on disk for inspection.
pub fn provision(ctx: &SandboxContext, label: &str) -> Result<Provisioned, SandboxError> {
    validate_label(label)?;
    let _lock = ctx.lock(label)?;

    if let Some(existing) = ctx.registry.get(label) {
        if existing.is_degraded() {
            return Err(SandboxError::Degraded(label.to_string()));
        }
        if ctx.prober.is_alive(existing.port) {
            return Err(SandboxError::AlreadyRunning {
                label: label.to_string(),
                port: existing.port,
            });
        }
        warn!(label, port = existing.port, "provision:replacing unreachable entry");
    }

    provision_locked(ctx, label)
}

/// Provisioning body; the caller holds the label lock.
pub(super) fn provision_locked(
    ctx: &SandboxContext,
    label: &str,
) -> Result<Provisioned, SandboxError> {
    info!(label, "provision:start");

    ctx.toolchain
        .preflight()
        .map_err(|e| fetch_error(label, &e))?;

    let root = create_workdir(&ctx.config.work_dir(), label).map_err(|e| fetch_error(label, &e))?;
    let layout = SandboxLayout::new(&root);
    info!(label, path = %root.display(), "provision:workdir");

    ctx.toolchain
        .fetch(&layout)
        .map_err(|e| fetch_error(label, &e))?;

    let port = ctx.registry.allocate_port(ctx.config.port_range)?;
    info!(label, port, "provision:port");

    ctx.toolchain
        .configure(&layout)
        .map_err(|e| build_error(label, Step::Configure, &e))?;
    ctx.rebuild(label, &layout)?;
    ctx.toolchain
        .init_storage(&layout)
        .map_err(|e| runtime_error(label, Step::Initdb, &e))?;
    ctx.start_server(label, &layout, port)?;

    if let Err(e) = ctx.registry.add(label, port, &root) {
        // Nobody can find an unregistered server; do not leave it running
        error!(label, port, error = %e, "provision:register failed, stopping server");
        let _ = ctx.toolchain.stop(&layout, StopMode::Immediate);
        return Err(e);
    }

    info!(label, port, path = %root.display(), "provision:committed");
    Ok(Provisioned {
        label: label.to_string(),
        port,
        path: root,
    })
}

fn fetch_error(label: &str, err: &anyhow::Error) -> SandboxError {
    SandboxError::Fetch {
        label: label.to_string(),
        detail: detail(err),
    }
}

/// Create `<work_dir>/pgdbg_<label>_<random>`, never reusing an existing directory.
fn create_workdir(work_dir: &Path, label: &str) -> Result<PathBuf> {
    fs::create_dir_all(work_dir)
        .with_context(|| format!("Failed to create work directory {}", work_dir.display()))?;

    for _ in 0..16 {
        let suffix =
            getrandom::u32().map_err(|e| anyhow!("Failed to read OS randomness: {e}"))?;
        let candidate = work_dir.join(format!("{WORKDIR_PREFIX}{label}_{suffix:08x}"));
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to create {}", candidate.display()));
            }
        }
    }
    Err(anyhow!(
        "Could not find an unused directory name under {}",
        work_dir.display()
    ))
}

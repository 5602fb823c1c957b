use tracing::{debug, info, warn};

use super::context::SandboxContext;
use super::provision::provision_locked;
use super::stop::stop_locked;
use super::types::{Acquired, Health};
use super::{DEFAULT_LABEL, validate_label};
use crate::error::SandboxError;
use crate::registry::SandboxInfo;

/// Return a live sandbox, provisioning one if necessary.
///
/// With a label, a live entry is reused and a dead one is dropped and rebuilt.
/// Without one, the first live sandbox in label order is used; dead entries met
/// along the way are dropped, and `default` is provisioned if nothing is live.
pub fn ensure(ctx: &SandboxContext, label: Option<&str>) -> Result<Acquired, SandboxError> {
    match label {
        Some(label) => ensure_label(ctx, label),
        None => ensure_any(ctx),
    }
}

fn ensure_label(ctx: &SandboxContext, label: &str) -> Result<Acquired, SandboxError> {
    validate_label(label)?;
    let _lock = ctx.lock(label)?;

    if let Some(info) = ctx.registry.get(label) {
        match ctx.health(&info) {
            Health::Live => return Ok(reused(label, &info)),
            Health::Degraded => return Err(SandboxError::Degraded(label.to_string())),
            Health::Unreachable => drop_dead(ctx, label, &info)?,
        }
    }

    let p = provision_locked(ctx, label)?;
    Ok(Acquired {
        label: p.label,
        port: p.port,
        path: p.path,
        provisioned: true,
    })
}

fn ensure_any(ctx: &SandboxContext) -> Result<Acquired, SandboxError> {
    for (label, info) in ctx.registry.list() {
        match ctx.health(&info) {
            Health::Live => {
                debug!(label = %label, port = info.port, "ensure:found live");
                return Ok(reused(&label, &info));
            }
            Health::Degraded => continue,
            Health::Unreachable => {
                // A busy label may be mid-patch with its server stopped
                let Ok(_lock) = ctx.lock(&label) else {
                    debug!(label = %label, "ensure:skipping busy entry");
                    continue;
                };
                // Re-read under the lock; it may have changed since the listing
                if let Some(current) = ctx.registry.get(&label)
                    && ctx.health(&current) == Health::Unreachable
                {
                    drop_dead(ctx, &label, &current)?;
                }
            }
        }
    }

    info!("ensure:no live sandbox, provisioning default");
    ensure_label(ctx, DEFAULT_LABEL)
}

fn drop_dead(ctx: &SandboxContext, label: &str, info: &SandboxInfo) -> Result<(), SandboxError> {
    warn!(label, port = info.port, "ensure:purging dead entry");
    stop_locked(ctx, label, info, false).map(|_| ())
}

fn reused(label: &str, info: &SandboxInfo) -> Acquired {
    Acquired {
        label: label.to_string(),
        port: info.port,
        path: info.path.clone(),
        provisioned: false,
    }
}

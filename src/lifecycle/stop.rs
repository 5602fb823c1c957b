use std::fs;

use tracing::{debug, info, warn};

use super::context::{SandboxContext, runtime_error};
use super::types::StopReport;
use crate::error::{SandboxError, Step};
use crate::registry::SandboxInfo;
use crate::toolchain::{SandboxLayout, StopMode};

/// Stop a sandbox's server and remove it from the registry.
///
/// A server that is already down is not an error. With `purge` the working
/// directory is deleted as well; failing to delete it only logs a warning.
/// Any registered label is accepted, including ones older registries allowed.
pub fn stop(ctx: &SandboxContext, label: &str, purge: bool) -> Result<StopReport, SandboxError> {
    let _lock = ctx.lock(label)?;

    let info = ctx
        .registry
        .get(label)
        .ok_or_else(|| SandboxError::NotFound(label.to_string()))?;
    stop_locked(ctx, label, &info, purge)
}

/// Stop every registered sandbox, continuing past failures.
pub fn stop_all(
    ctx: &SandboxContext,
    purge: bool,
) -> Vec<(String, Result<StopReport, SandboxError>)> {
    let labels: Vec<String> = ctx.registry.list().into_keys().collect();
    info!(count = labels.len(), "stop_all:start");
    labels
        .into_iter()
        .map(|label| {
            let result = stop(ctx, &label, purge);
            if let Err(e) = &result {
                warn!(label = %label, error = %e, "stop_all:failed");
            }
            (label, result)
        })
        .collect()
}

/// Stop body; the caller holds the label lock.
pub(super) fn stop_locked(
    ctx: &SandboxContext,
    label: &str,
    info: &SandboxInfo,
    purge: bool,
) -> Result<StopReport, SandboxError> {
    let layout = SandboxLayout::new(&info.path);
    let answering = ctx.prober.is_alive(info.port);
    // State is unknown after a failed rollback; don't wait on a clean shutdown
    let mode = if info.is_degraded() {
        StopMode::Immediate
    } else {
        StopMode::Fast
    };

    // Always ask the server to stop: a postmaster can hold its port while
    // refusing connections (startup, recovery, connection limit).
    let was_running = match ctx.toolchain.stop(&layout, mode) {
        Ok(()) => true,
        Err(e) if answering => return Err(runtime_error(label, Step::Stop, &e)),
        Err(e) => {
            debug!(label, error = %e, "stop:server already down");
            false
        }
    };

    ctx.registry.remove(label)?;

    let purged = purge && purge_workdir(label, info);
    info!(label, port = info.port, was_running, purged, "stop:done");
    Ok(StopReport {
        label: label.to_string(),
        port: info.port,
        was_running,
        purged,
    })
}

fn purge_workdir(label: &str, info: &SandboxInfo) -> bool {
    match fs::remove_dir_all(&info.path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(label, path = %info.path.display(), error = %e, "stop:purge failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::provision::provision;
    use super::super::testing::fixture;
    use super::*;
    use crate::probe::Prober;
    use crate::registry::EntryStatus;
    use std::path::Path;

    #[test]
    fn stop_deregisters_and_keeps_workdir() {
        let (_tmp, ctx, fake) = fixture();
        let p = provision(&ctx, "alpha").unwrap();

        let report = stop(&ctx, "alpha", false).unwrap();
        assert!(report.was_running);
        assert!(!report.purged);
        assert_eq!(report.port, p.port);
        assert!(!fake.is_alive(p.port));
        assert!(ctx.registry.get("alpha").is_none());
        assert!(p.path.is_dir());
    }

    #[test]
    fn purge_removes_workdir() {
        let (_tmp, ctx, _fake) = fixture();
        let p = provision(&ctx, "alpha").unwrap();
        let report = stop(&ctx, "alpha", true).unwrap();
        assert!(report.purged);
        assert!(!p.path.exists());
    }

    #[test]
    fn dead_server_is_just_deregistered() {
        let (_tmp, ctx, fake) = fixture();
        ctx.registry.add("gone", 58000, Path::new("/nonexistent")).unwrap();

        let report = stop(&ctx, "gone", false).unwrap();
        assert!(!report.was_running);
        assert_eq!(fake.calls(), vec![Step::Stop]);
        assert!(ctx.registry.list().is_empty());
    }

    #[test]
    fn server_refusing_connections_is_still_stopped() {
        let (_tmp, ctx, fake) = fixture();
        let p = provision(&ctx, "alpha").unwrap();
        // Running, but the handshake is rejected
        fake.set_alive(p.port, false);
        fake.clear_calls();

        let report = stop(&ctx, "alpha", false).unwrap();
        assert!(report.was_running);
        assert_eq!(fake.calls(), vec![Step::Stop]);
        assert!(ctx.registry.get("alpha").is_none());

        // The postmaster is really gone: a second stop finds nothing to stop
        ctx.registry.add("alpha", p.port, &p.path).unwrap();
        assert!(!stop(&ctx, "alpha", false).unwrap().was_running);
    }

    #[test]
    fn legacy_labels_can_be_stopped() {
        let (tmp, ctx, _fake) = fixture();
        ctx.registry.add("my sandbox", 58000, Path::new("/nonexistent")).unwrap();
        ctx.registry.add("../escape", 58001, Path::new("/nonexistent")).unwrap();

        let results = stop_all(&ctx, false);
        assert!(results.iter().all(|(_, r)| r.is_ok()), "{results:?}");
        assert!(ctx.registry.list().is_empty());
        assert!(!tmp.path().join("escape.lock").exists());
        assert!(!tmp.path().join("state/escape.lock").exists());
    }

    #[test]
    fn failed_stop_keeps_entry() {
        let (_tmp, ctx, fake) = fixture();
        let p = provision(&ctx, "alpha").unwrap();
        fake.fail(Step::Stop);

        let err = stop(&ctx, "alpha", true).unwrap_err();
        assert_eq!(err.step(), Some(Step::Stop));
        assert!(ctx.registry.get("alpha").is_some());
        assert!(p.path.is_dir());
    }

    #[test]
    fn stop_clears_degraded_entry() {
        let (_tmp, ctx, _fake) = fixture();
        provision(&ctx, "alpha").unwrap();
        ctx.registry
            .set_status("alpha", EntryStatus::Degraded)
            .unwrap();

        stop(&ctx, "alpha", false).unwrap();
        assert!(ctx.registry.get("alpha").is_none());
        provision(&ctx, "alpha").unwrap();
    }

    #[test]
    fn unknown_label_is_not_found() {
        let (_tmp, ctx, _fake) = fixture();
        assert!(matches!(
            stop(&ctx, "ghost", false),
            Err(SandboxError::NotFound(_))
        ));
    }

    #[test]
    fn stop_all_continues_past_failures() {
        let (_tmp, ctx, fake) = fixture();
        let a = provision(&ctx, "a").unwrap();
        provision(&ctx, "b").unwrap();
        let c = provision(&ctx, "c").unwrap();

        let held = ctx.lock("b").unwrap();
        let results = stop_all(&ctx, false);
        drop(held);

        let labels: Vec<&str> = results.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(labels, vec!["a", "b", "c"]);
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(SandboxError::Busy(_))));
        assert!(results[2].1.is_ok());

        assert!(!fake.is_alive(a.port));
        assert!(!fake.is_alive(c.port));
        let remaining: Vec<String> = ctx.registry.list().into_keys().collect();
        assert_eq!(remaining, vec!["b".to_string()]);
    }
}

use std::fmt;
use std::path::PathBuf;

/// One external step of a provisioning or patch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Clone,
    Configure,
    Build,
    Install,
    Initdb,
    Start,
    Stop,
    Check,
    Apply,
    Commit,
    Reset,
    Register,
    Lock,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Clone => "clone",
            Step::Configure => "configure",
            Step::Build => "build",
            Step::Install => "install",
            Step::Initdb => "initdb",
            Step::Start => "start",
            Step::Stop => "stop",
            Step::Check => "check",
            Step::Apply => "apply",
            Step::Commit => "commit",
            Step::Reset => "reset",
            Step::Register => "register",
            Step::Lock => "lock",
        };
        f.write_str(name)
    }
}

/// Every failure the lifecycle engine reports to its caller.
///
/// Nothing here is retried inside the engine.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox '{label}': fetching sources failed: {detail}")]
    Fetch { label: String, detail: String },

    #[error("sandbox '{label}': {step} failed: {detail}")]
    Build {
        label: String,
        step: Step,
        detail: String,
    },

    #[error("sandbox '{label}': patch does not apply cleanly: {detail}")]
    Validation { label: String, detail: String },

    #[error("sandbox '{label}': could not stage patch: {detail}")]
    Staging { label: String, detail: String },

    #[error("sandbox '{label}': server {step} failed: {detail}")]
    Runtime {
        label: String,
        step: Step,
        detail: String,
    },

    #[error("sandbox '{label}': patch rejected, previous version restored: {cause}")]
    RolledBack {
        label: String,
        cause: Box<SandboxError>,
    },

    #[error(
        "sandbox '{label}' is degraded: patch failed ({cause}) and rollback {step} failed: {detail}"
    )]
    RollbackFailure {
        label: String,
        step: Step,
        cause: Box<SandboxError>,
        detail: String,
    },

    #[error("registry {}: {detail}", path.display())]
    Registry { path: PathBuf, detail: String },

    #[error("no sandbox named '{0}'")]
    NotFound(String),

    #[error("sandbox '{0}' is busy with another operation")]
    Busy(String),

    #[error("sandbox '{label}' is already running on port {port}")]
    AlreadyRunning { label: String, port: u16 },

    #[error("sandbox '{label}' is not reachable on port {port}")]
    Unreachable { label: String, port: u16 },

    #[error("sandbox '{0}' is degraded; stop it before reusing the label")]
    Degraded(String),

    #[error("invalid sandbox label '{0}': use letters, digits, '_', '-' or '.'")]
    InvalidLabel(String),

    #[error("no free port left in {min}..={max}")]
    PortsExhausted { min: u16, max: u16 },
}

impl SandboxError {
    /// The step that failed, when the error came from an external step.
    pub fn step(&self) -> Option<Step> {
        match self {
            SandboxError::Fetch { .. } => Some(Step::Clone),
            SandboxError::Build { step, .. } | SandboxError::Runtime { step, .. } => Some(*step),
            SandboxError::Validation { .. } => Some(Step::Check),
            SandboxError::RolledBack { cause, .. } => cause.step(),
            SandboxError::RollbackFailure { step, .. } => Some(*step),
            SandboxError::Registry { .. } => Some(Step::Register),
            SandboxError::Busy(_) => Some(Step::Lock),
            _ => None,
        }
    }

    /// The sandbox label the error is about, if any.
    pub fn label(&self) -> Option<&str> {
        match self {
            SandboxError::Fetch { label, .. }
            | SandboxError::Build { label, .. }
            | SandboxError::Validation { label, .. }
            | SandboxError::Staging { label, .. }
            | SandboxError::Runtime { label, .. }
            | SandboxError::RolledBack { label, .. }
            | SandboxError::RollbackFailure { label, .. }
            | SandboxError::AlreadyRunning { label, .. }
            | SandboxError::Unreachable { label, .. } => Some(label),
            SandboxError::NotFound(label)
            | SandboxError::Busy(label)
            | SandboxError::Degraded(label)
            | SandboxError::InvalidLabel(label) => Some(label),
            SandboxError::Registry { .. } | SandboxError::PortsExhausted { .. } => None,
        }
    }
}

/// Render an anyhow chain on one line for embedding in a `SandboxError`.
pub fn detail(err: &anyhow::Error) -> String {
    format!("{:#}", err).replace('\n', " | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolled_back_reports_inner_step() {
        let err = SandboxError::RolledBack {
            label: "alpha".into(),
            cause: Box::new(SandboxError::Build {
                label: "alpha".into(),
                step: Step::Build,
                detail: "make: *** [all] Error 2".into(),
            }),
        };
        assert_eq!(err.step(), Some(Step::Build));
        assert_eq!(err.label(), Some("alpha"));
        let msg = err.to_string();
        assert!(msg.contains("previous version restored"));
        assert!(msg.contains("build failed"));
    }

    #[test]
    fn detail_flattens_context_chain() {
        let err = anyhow::anyhow!("exit 2\nstderr line").context("make -j4");
        let rendered = detail(&err);
        assert!(rendered.starts_with("make -j4: exit 2"));
        assert!(!rendered.contains('\n'));
    }
}

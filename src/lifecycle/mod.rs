//! Sandbox lifecycle: provisioning, patching with rollback, acquisition and teardown.

mod context;
mod ensure;
mod patch;
mod provision;
mod stop;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::OnceLock;

use regex::Regex;

use crate::error::SandboxError;

pub use context::SandboxContext;
pub use ensure::ensure;
pub use patch::apply_patch;
pub use provision::provision;
pub use stop::{stop, stop_all};
pub use types::{Acquired, Health, PatchReport, Provisioned, StopReport};

/// Label used when a caller asks for "any sandbox" and none is live.
pub const DEFAULT_LABEL: &str = "default";

/// Labels double as lock file names, so keep them filesystem-safe.
pub fn validate_label(label: &str) -> Result<(), SandboxError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").expect("label regex is valid")
    });
    if re.is_match(label) {
        Ok(())
    } else {
        Err(SandboxError::InvalidLabel(label.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_labels() {
        for label in ["alpha", "default", "bug-1234", "v17.2_rc", "A"] {
            validate_label(label).unwrap();
        }
    }

    #[test]
    fn rejects_unsafe_labels() {
        for label in ["", "../etc", "a/b", "-flag", ".hidden", "has space"] {
            assert!(matches!(
                validate_label(label),
                Err(SandboxError::InvalidLabel(_))
            ));
        }
        assert!(validate_label(&"x".repeat(65)).is_err());
    }
}

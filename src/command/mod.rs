pub mod apply_patch;
pub mod call;
pub mod ensure;
pub mod list;
pub mod new;
pub mod path;
pub mod stop;

use anyhow::Result;

use crate::config::Config;
use crate::lifecycle::SandboxContext;

/// Lifecycle context for the user's configuration and the real toolchain.
pub fn context() -> Result<SandboxContext> {
    let config = Config::load()?;
    Ok(SandboxContext::new(config))
}

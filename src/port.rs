//! Port allocation for new sandboxes.
//!
//! Only picks a number; nothing is bound here. The server binds it on start.

use std::collections::HashSet;

use crate::config::PortRange;
use crate::error::SandboxError;

/// Pick a port uniformly from `range` that is not in `taken`, using the OS RNG.
pub fn next_free_port(taken: &HashSet<u16>, range: PortRange) -> Result<u16, SandboxError> {
    next_free_port_with(taken, range, || {
        getrandom::u32().unwrap_or_else(|_| fallback_entropy())
    })
}

/// Same as [`next_free_port`] with an injectable random source.
pub fn next_free_port_with(
    taken: &HashSet<u16>,
    range: PortRange,
    mut random: impl FnMut() -> u32,
) -> Result<u16, SandboxError> {
    let span = u32::from(range.max - range.min) + 1;
    let free = (range.min..=range.max).filter(|p| !taken.contains(p)).count();
    if free == 0 {
        return Err(SandboxError::PortsExhausted {
            min: range.min,
            max: range.max,
        });
    }

    loop {
        let candidate = range.min + (random() % span) as u16;
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
    }
}

fn fallback_entropy() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ std::process::id())
        .unwrap_or(0)
}

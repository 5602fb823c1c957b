use anyhow::Result;

use crate::config;

/// Print the source root inspection tools should read.
pub fn run(label: Option<&str>) -> Result<()> {
    let ctx = super::context()?;
    let root = ctx.source_root(config::source_root_override(), label)?;
    println!("{}", root.display());
    Ok(())
}

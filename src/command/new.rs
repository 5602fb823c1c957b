use anyhow::Result;
use console::style;

use crate::lifecycle;
use crate::spinner::with_spinner;

pub fn run(label: &str) -> Result<()> {
    let ctx = super::context()?;
    let sandbox = with_spinner(&format!("Provisioning sandbox '{label}'"), || {
        Ok(lifecycle::provision(&ctx, label)?)
    })?;

    println!(
        "{} Sandbox '{}' running on port {}",
        style("✓").green(),
        sandbox.label,
        sandbox.port
    );
    println!("  {}", style(sandbox.path.display()).dim());
    Ok(())
}

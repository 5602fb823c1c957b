use anyhow::Result;
use console::style;

use crate::lifecycle;
use crate::spinner::with_spinner;

pub fn run(label: Option<&str>) -> Result<()> {
    let ctx = super::context()?;
    let msg = match label {
        Some(label) => format!("Acquiring sandbox '{label}'"),
        None => "Acquiring a sandbox".to_string(),
    };
    let sandbox = with_spinner(&msg, || Ok(lifecycle::ensure(&ctx, label)?))?;

    let how = if sandbox.provisioned {
        "provisioned"
    } else {
        "reused"
    };
    println!(
        "{} Sandbox '{}' on port {} ({})",
        style("✓").green(),
        sandbox.label,
        sandbox.port,
        how
    );
    println!("  {}", style(sandbox.path.display()).dim());
    Ok(())
}

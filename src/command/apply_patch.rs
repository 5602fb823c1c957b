use std::fs;
use std::io::{IsTerminal, Read};
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use console::style;

use crate::lifecycle;
use crate::spinner::with_spinner;

pub fn run(label: &str, file: &str) -> Result<()> {
    let (patch, name) = read_patch(file)?;
    let ctx = super::context()?;

    let report = with_spinner(&format!("Applying {name} to '{label}'"), || {
        Ok(lifecycle::apply_patch(&ctx, label, &patch, &name)?)
    })?;

    println!(
        "{} Patch {} applied to '{}' ({} -> {}), server on port {}",
        style("✓").green(),
        name,
        report.label,
        short(&report.previous_revision),
        short(&report.revision),
        report.port
    );
    Ok(())
}

/// Read the diff from `file`, or stdin when it is `-`. Returns the text and a display name.
fn read_patch(file: &str) -> Result<(String, String)> {
    if file == "-" {
        // Guard: don't block on interactive TTY
        if std::io::stdin().is_terminal() {
            return Err(anyhow!("No patch on stdin. Pipe a diff or pass a file path"));
        }
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read patch from stdin")?;
        return Ok((buf, "stdin".to_string()));
    }

    let path = Path::new(file);
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read patch file {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.to_string());
    Ok((text, name))
}

fn short(revision: &str) -> &str {
    revision.get(..12).unwrap_or(revision)
}

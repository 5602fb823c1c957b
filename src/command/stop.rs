use anyhow::{Result, bail};
use console::style;

use crate::lifecycle::{self, StopReport};

pub fn run(label: &str, purge: bool) -> Result<()> {
    let ctx = super::context()?;
    let report = lifecycle::stop(&ctx, label, purge)?;
    print_stopped(&report);
    Ok(())
}

/// Stop every sandbox. Keeps going past failures, then fails if any occurred.
pub fn run_all(purge: bool) -> Result<()> {
    let ctx = super::context()?;
    let results = lifecycle::stop_all(&ctx, purge);
    if results.is_empty() {
        println!("No sandboxes registered");
        return Ok(());
    }

    let total = results.len();
    let mut failed = 0;
    for (label, result) in results {
        match result {
            Ok(report) => print_stopped(&report),
            Err(e) => {
                failed += 1;
                eprintln!("{} {}: {}", style("✗").red(), label, e);
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {total} sandboxes failed to stop");
    }
    Ok(())
}

fn print_stopped(report: &StopReport) {
    let what = if report.was_running {
        "stopped"
    } else {
        "was not running"
    };
    let purged = if report.purged { ", files removed" } else { "" };
    println!(
        "{} {} (port {}) {}{}",
        style("✓").green(),
        report.label,
        report.port,
        what,
        purged
    );
}

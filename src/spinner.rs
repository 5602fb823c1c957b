use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(120));
    let spinner_style = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("{spinner:.blue} {msg} {elapsed:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(spinner_style);
    pb.set_message(msg.to_string());
    pb
}

/// Run a long operation (clone, build, restart) behind a spinner on stderr.
///
/// The final line keeps the elapsed time, since builds can take many minutes.
pub fn with_spinner<T, F>(msg: &str, op: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let pb = create_spinner(msg);
    let started = Instant::now();
    let result = op();
    let elapsed = format_elapsed(started.elapsed());
    match &result {
        Ok(_) => pb.finish_with_message(format!("{} {} ({})", style("✔").green(), msg, elapsed)),
        Err(_) => pb.finish_with_message(format!("{} {} ({})", style("✘").red(), msg, elapsed)),
    }
    result
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use crate::lifecycle::{Health, SandboxContext};

/// One registry entry as reported by `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    pub label: String,
    pub port: u16,
    pub path: PathBuf,
    pub started: u64,
    pub degraded: bool,
    /// Present only when probing was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<Health>,
}

#[derive(Tabled)]
struct SandboxRow {
    #[tabled(rename = "LABEL")]
    label: String,
    #[tabled(rename = "PORT")]
    port: u16,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "STARTED")]
    started: String,
    #[tabled(rename = "PATH")]
    path: String,
}

/// Registry snapshot in label order, optionally probed.
pub fn entries(ctx: &SandboxContext, probe: bool) -> Vec<ListEntry> {
    ctx.registry
        .list()
        .into_iter()
        .map(|(label, info)| ListEntry {
            health: probe.then(|| ctx.health(&info)),
            degraded: info.is_degraded(),
            label,
            port: info.port,
            path: info.path,
            started: info.started,
        })
        .collect()
}

pub fn run(probe: bool, json: bool) -> Result<()> {
    let ctx = super::context()?;
    let entries = entries(&ctx, probe);

    // Tables for people, JSON when piped into another tool
    if json || !std::io::stdout().is_terminal() {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No sandboxes registered");
        return Ok(());
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let rows: Vec<SandboxRow> = entries
        .into_iter()
        .map(|e| SandboxRow {
            status: status_label(&e),
            started: format_age(now.saturating_sub(e.started)),
            label: e.label,
            port: e.port,
            path: e.path.display().to_string(),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..5), Padding::new(0, 1, 0, 0));
    println!("{table}");
    Ok(())
}

fn status_label(entry: &ListEntry) -> String {
    match entry.health {
        Some(health) => health.to_string(),
        None if entry.degraded => Health::Degraded.to_string(),
        None => "-".to_string(),
    }
}

fn format_age(secs: u64) -> String {
    match secs {
        0..60 => format!("{secs}s ago"),
        60..3600 => format!("{}m ago", secs / 60),
        3600..86400 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::testing::fixture;
    use crate::registry::EntryStatus;
    use std::path::Path;

    #[test]
    fn entries_are_probed_only_on_request() {
        let (_tmp, ctx, fake) = fixture();
        ctx.registry.add("b", 58001, Path::new("/b")).unwrap();
        ctx.registry.add("a", 58000, Path::new("/a")).unwrap();
        ctx.registry.set_status("b", EntryStatus::Degraded).unwrap();
        fake.set_alive(58000, true);
        fake.set_alive(58001, true);

        let plain = entries(&ctx, false);
        assert_eq!(plain.len(), 2);
        assert_eq!(plain[0].label, "a");
        assert!(plain.iter().all(|e| e.health.is_none()));
        assert!(plain[1].degraded);

        let probed = entries(&ctx, true);
        assert_eq!(probed[0].health, Some(Health::Live));
        assert_eq!(probed[1].health, Some(Health::Degraded));
    }

    #[test]
    fn json_omits_health_unless_probed() {
        let (_tmp, ctx, _fake) = fixture();
        ctx.registry.add("a", 58000, Path::new("/a")).unwrap();

        let json = serde_json::to_value(entries(&ctx, false)).unwrap();
        assert!(json[0].get("health").is_none());
        let json = serde_json::to_value(entries(&ctx, true)).unwrap();
        assert_eq!(json[0]["health"], "unreachable");
    }

    #[test]
    fn status_label_shows_degraded_without_probe() {
        let entry = ListEntry {
            label: "a".into(),
            port: 1,
            path: PathBuf::from("/a"),
            started: 0,
            degraded: true,
            health: None,
        };
        assert_eq!(status_label(&entry), "degraded");
    }

    #[test]
    fn ages_are_compact() {
        assert_eq!(format_age(5), "5s ago");
        assert_eq!(format_age(125), "2m ago");
        assert_eq!(format_age(7200), "2h ago");
        assert_eq!(format_age(3 * 86400), "3d ago");
    }
}

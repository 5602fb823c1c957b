use anyhow::{Context, Result, anyhow};
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use which::which;

use super::{SandboxLayout, StopMode, Toolchain};
use crate::cmd::Cmd;
use crate::config::{Config, Timeouts};

/// Bootstrap superuser created by initdb
const SUPERUSER: &str = "postgres";

/// Paths the sandbox keeps inside the checkout that git must never track.
const LOCAL_EXCLUDES: &str = "/install/\n/data/\n/server.log\n";

const COMMITTER: [&str; 4] = [
    "-c",
    "user.name=pgsandbox",
    "-c",
    "user.email=pgsandbox@localhost",
];

/// Autotools build of PostgreSQL driven through git, make, initdb and pg_ctl.
pub struct PostgresToolchain {
    source_url: String,
    source_branch: Option<String>,
    build_jobs: u32,
    configure_args: Vec<String>,
    timeouts: Timeouts,
}

impl PostgresToolchain {
    pub fn new(config: &Config) -> Self {
        Self {
            source_url: config.source_url().to_string(),
            source_branch: config.source_branch.clone(),
            build_jobs: config.build_jobs(),
            configure_args: config.configure_args.clone(),
            timeouts: config.timeouts.clone(),
        }
    }

    fn git<'a>(&self, layout: &'a SandboxLayout) -> Cmd<'a> {
        Cmd::new("git")
            .workdir(layout.root())
            .timeout(self.timeouts.git())
    }

    fn clone_args(&self, dest: &Path) -> Vec<String> {
        let mut args = vec!["clone".to_string(), "--depth=1".to_string()];
        if let Some(branch) = &self.source_branch {
            args.push(format!("--branch={branch}"));
        }
        args.push(self.source_url.clone());
        args.push(dest.display().to_string());
        args
    }

    fn configure_args(&self, layout: &SandboxLayout) -> Vec<String> {
        let mut args = vec![format!("--prefix={}", layout.prefix().display())];
        args.extend(self.configure_args.iter().cloned());
        args
    }

    fn start_args(&self, layout: &SandboxLayout, port: u16) -> Vec<String> {
        vec![
            "-D".to_string(),
            layout.data_dir().display().to_string(),
            "-o".to_string(),
            format!("-p {port}"),
            "-l".to_string(),
            layout.server_log().display().to_string(),
            "-w".to_string(),
            "-t".to_string(),
            self.timeouts.start.to_string(),
            "start".to_string(),
        ]
    }

    fn stop_args(&self, layout: &SandboxLayout, mode: StopMode) -> Vec<String> {
        let mode = match mode {
            StopMode::Fast => "fast",
            StopMode::Immediate => "immediate",
        };
        vec![
            "-D".to_string(),
            layout.data_dir().display().to_string(),
            "-m".to_string(),
            mode.to_string(),
            "-w".to_string(),
            "-t".to_string(),
            self.timeouts.stop.to_string(),
            "stop".to_string(),
        ]
    }
}

impl Toolchain for PostgresToolchain {
    fn preflight(&self) -> Result<()> {
        for tool in ["git", "make"] {
            which(tool).map_err(|_| anyhow!("'{}' was not found on PATH", tool))?;
        }
        Ok(())
    }

    fn fetch(&self, layout: &SandboxLayout) -> Result<()> {
        info!(url = %self.source_url, dest = %layout.root().display(), "toolchain:clone");
        Cmd::new("git")
            .args(self.clone_args(layout.root()))
            .timeout(self.timeouts.fetch())
            .run()
            .context("git clone failed")?;

        let exclude = layout.root().join(".git/info/exclude");
        if let Some(parent) = exclude.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut contents = fs::read_to_string(&exclude).unwrap_or_default();
        contents.push_str(LOCAL_EXCLUDES);
        fs::write(&exclude, contents)
            .with_context(|| format!("Failed to write {}", exclude.display()))?;
        Ok(())
    }

    fn configure(&self, layout: &SandboxLayout) -> Result<()> {
        Cmd::new(layout.root().join("configure"))
            .args(self.configure_args(layout))
            .workdir(layout.root())
            .timeout(self.timeouts.configure())
            .run()
            .context("configure failed")?;
        Ok(())
    }

    fn build(&self, layout: &SandboxLayout) -> Result<()> {
        Cmd::new("make")
            .arg(format!("-j{}", self.build_jobs))
            .workdir(layout.root())
            .timeout(self.timeouts.build())
            .run()
            .context("make failed")?;
        Ok(())
    }

    fn install(&self, layout: &SandboxLayout) -> Result<()> {
        Cmd::new("make")
            .arg("install")
            .workdir(layout.root())
            .timeout(self.timeouts.install())
            .run()
            .context("make install failed")?;
        Ok(())
    }

    fn init_storage(&self, layout: &SandboxLayout) -> Result<()> {
        Cmd::new(layout.bin_dir().join("initdb"))
            .arg("-D")
            .arg(layout.data_dir())
            .arg(format!("--username={SUPERUSER}"))
            .arg("--auth=trust")
            .timeout(self.timeouts.initdb())
            .run()
            .context("initdb failed")?;
        Ok(())
    }

    fn start(&self, layout: &SandboxLayout, port: u16) -> Result<()> {
        debug!(port, data = %layout.data_dir().display(), "toolchain:start");
        Cmd::new(layout.bin_dir().join("pg_ctl"))
            .args(self.start_args(layout, port))
            .env("PGPORT", port.to_string())
            .timeout(self.timeouts.start() + self.timeouts.git())
            .run()
            .with_context(|| format!("pg_ctl start failed (see {})", layout.server_log().display()))?;
        Ok(())
    }

    fn stop(&self, layout: &SandboxLayout, mode: StopMode) -> Result<()> {
        debug!(?mode, data = %layout.data_dir().display(), "toolchain:stop");
        Cmd::new(layout.bin_dir().join("pg_ctl"))
            .args(self.stop_args(layout, mode))
            .timeout(self.timeouts.stop() + self.timeouts.git())
            .run()
            .context("pg_ctl stop failed")?;
        Ok(())
    }

    fn head_revision(&self, layout: &SandboxLayout) -> Result<String> {
        self.git(layout)
            .args(["rev-parse", "HEAD"])
            .run_and_capture_stdout()
            .context("Failed to read HEAD revision")
    }

    fn uncommitted_changes(&self, layout: &SandboxLayout) -> Result<Vec<String>> {
        let output = self
            .git(layout)
            .args(["status", "--porcelain"])
            .run()
            .context("git status failed")?;
        // Lines are "XY path"; the status columns may be blank
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.get(3..))
            .map(str::to_string)
            .collect())
    }

    fn check_patch(&self, layout: &SandboxLayout, patch: &Path) -> Result<()> {
        self.git(layout)
            .args(["apply", "--check"])
            .arg(patch)
            .run()
            .context("git apply --check failed")?;
        Ok(())
    }

    fn apply_patch(&self, layout: &SandboxLayout, patch: &Path) -> Result<()> {
        self.git(layout)
            .args(["apply", "--whitespace=nowarn"])
            .arg(patch)
            .run()
            .context("git apply failed")?;
        Ok(())
    }

    fn commit(&self, layout: &SandboxLayout, message: &str) -> Result<()> {
        self.git(layout)
            .args(["add", "--all"])
            .run()
            .context("git add failed")?;
        self.git(layout)
            .args(COMMITTER)
            .args(["commit", "--quiet", "--no-verify", "--allow-empty", "-m"])
            .arg(message)
            .run()
            .context("git commit failed")?;
        Ok(())
    }

    fn reset(&self, layout: &SandboxLayout, revision: &str) -> Result<()> {
        self.git(layout)
            .args(["reset", "--hard", "--quiet", revision])
            .run()
            .context("git reset failed")?;
        self.git(layout)
            .args(["clean", "-fd", "--quiet"])
            .run()
            .context("git clean failed")?;
        Ok(())
    }
}

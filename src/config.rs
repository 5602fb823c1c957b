use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Upstream repository cloned into every new sandbox.
pub const DEFAULT_SOURCE_URL: &str = "https://github.com/postgres/postgres.git";

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "PGSANDBOX_CONFIG";

/// Environment variable overriding the state directory (registry and locks).
pub const STATE_DIR_ENV: &str = "PGSANDBOX_STATE_DIR";

/// Environment variable read-only inspection tools use to pin a source tree.
pub const SOURCE_ROOT_ENV: &str = "PG_DEBUGGER_SRC";

/// Range new sandbox ports are drawn from (inclusive)
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 56000,
            max: 60000,
        }
    }
}

/// Upper bounds for each external step, in seconds.
///
/// A step that exceeds its bound is killed and reported exactly like a
/// non-zero exit of that step.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Timeouts {
    pub fetch: u64,
    pub configure: u64,
    pub build: u64,
    pub install: u64,
    pub initdb: u64,
    pub start: u64,
    pub stop: u64,
    /// Local git operations (check, apply, commit, reset)
    pub git: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            fetch: 1800,
            configure: 900,
            build: 7200,
            install: 900,
            initdb: 300,
            start: 120,
            stop: 120,
            git: 120,
        }
    }
}

impl Timeouts {
    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch)
    }

    pub fn configure(&self) -> Duration {
        Duration::from_secs(self.configure)
    }

    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build)
    }

    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install)
    }

    pub fn initdb(&self) -> Duration {
        Duration::from_secs(self.initdb)
    }

    pub fn start(&self) -> Duration {
        Duration::from_secs(self.start)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_secs(self.stop)
    }

    pub fn git(&self) -> Duration {
        Duration::from_secs(self.git)
    }
}

/// Liveness probe settings
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ProbeConfig {
    /// Roles tried in order during the startup handshake.
    /// Default: postgres, then $USER
    pub users: Vec<String>,
    /// Connect/read timeout per attempt
    pub timeout_ms: u64,
    /// How many probes to try after a start before declaring it failed
    pub attempts: u32,
    /// Pause between those probes
    pub interval_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        let mut users = vec!["postgres".to_string()];
        if let Ok(user) = std::env::var("USER")
            && !user.is_empty()
            && user != "postgres"
        {
            users.push(user);
        }
        Self {
            users,
            timeout_ms: 1000,
            attempts: 20,
            interval_ms: 500,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Configuration for pgsandbox, read from ~/.config/pgsandbox/config.yaml
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Git URL of the server sources. Default: upstream PostgreSQL
    #[serde(default)]
    pub source_url: Option<String>,

    /// Branch to clone instead of the remote default
    #[serde(default)]
    pub source_branch: Option<String>,

    /// Parent directory for new sandbox checkouts. Default: system temp dir
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Where the registry and lock files live. Default: ~/.pg_debugger_agent
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Parallel make jobs. Default: 4
    #[serde(default)]
    pub build_jobs: Option<u32>,

    /// Extra arguments appended to ./configure
    #[serde(default)]
    pub configure_args: Vec<String>,

    #[serde(default)]
    pub port_range: PortRange,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default)]
    pub probe: ProbeConfig,
}

impl Config {
    /// Load the global config file, falling back to defaults when absent.
    pub fn load() -> anyhow::Result<Self> {
        debug!("config:loading");
        let config = match Self::config_path() {
            Some(path) => Self::load_from_path(&path)?.unwrap_or_default(),
            None => Self::default(),
        };
        config.validate()?;
        debug!(
            state_dir = %config.state_dir().display(),
            work_dir = %config.work_dir().display(),
            "config:loaded"
        );
        Ok(config)
    }

    /// Load configuration from a specific path.
    fn load_from_path(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config at {}: {}", path.display(), e))?;
        Ok(Some(config))
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV)
            && !path.is_empty()
        {
            return Some(PathBuf::from(path));
        }
        let home_dir = home::home_dir()?;
        let yaml = home_dir.join(".config/pgsandbox/config.yaml");
        if yaml.exists() {
            return Some(yaml);
        }
        Some(home_dir.join(".config/pgsandbox/config.yml"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port_range.min > self.port_range.max {
            bail!(
                "port_range.min ({}) is greater than port_range.max ({})",
                self.port_range.min,
                self.port_range.max
            );
        }
        if self.build_jobs == Some(0) {
            bail!("build_jobs must be at least 1");
        }
        if self.probe.users.is_empty() {
            bail!("probe.users must name at least one role");
        }
        Ok(())
    }

    pub fn source_url(&self) -> &str {
        self.source_url.as_deref().unwrap_or(DEFAULT_SOURCE_URL)
    }

    pub fn build_jobs(&self) -> u32 {
        self.build_jobs.unwrap_or(4)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Resolve the state directory: env override, then config, then ~/.pg_debugger_agent
    pub fn state_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var(STATE_DIR_ENV)
            && !dir.is_empty()
        {
            return PathBuf::from(dir);
        }
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        home::home_dir()
            .map(|h| h.join(".pg_debugger_agent"))
            .unwrap_or_else(|| PathBuf::from(".pg_debugger_agent"))
    }
}

/// Source root pinned by the environment for inspection tools, if any.
pub fn source_root_override() -> Option<PathBuf> {
    std::env::var_os(SOURCE_ROOT_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

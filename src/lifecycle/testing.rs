//! In-memory toolchain for exercising the lifecycle without compiling a server.
//!
//! Source trees are modeled as a list of commits of patch texts. A few marker
//! strings inside patches drive failures:
//! - `BROKEN`: fails the dry-run check
//! - `NOBUILD`: build fails while the tree contains it
//! - `NOSTART`: start fails while the installed build contains it
//! - `NOANSWER`: start succeeds but the server never answers probes

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};

use super::SandboxContext;
use crate::config::Config;
use crate::error::Step;
use crate::probe::Prober;
use crate::toolchain::{SandboxLayout, StopMode, Toolchain};

#[derive(Debug, Default, Clone)]
struct Tree {
    commits: Vec<Vec<String>>,
    working: Vec<String>,
    installed: Vec<String>,
    running: Option<u16>,
    edits: Vec<String>,
}

impl Tree {
    fn head(&self) -> String {
        format!("r{}", self.commits.len())
    }
}

#[derive(Default)]
struct FakeState {
    trees: HashMap<PathBuf, Tree>,
    alive: HashSet<u16>,
    failing: HashSet<Step>,
    calls: Vec<Step>,
    silent: bool,
}

#[derive(Default)]
pub struct FakeToolchain {
    state: Mutex<FakeState>,
}

impl FakeToolchain {
    /// Make every future call of `step` fail
    pub fn fail(&self, step: Step) {
        self.state.lock().unwrap().failing.insert(step);
    }

    pub fn heal(&self, step: Step) {
        self.state.lock().unwrap().failing.remove(&step);
    }

    pub fn set_alive(&self, port: u16, alive: bool) {
        let mut state = self.state.lock().unwrap();
        if alive {
            state.alive.insert(port);
        } else {
            state.alive.remove(&port);
        }
    }

    /// Servers started from now on never answer probes
    pub fn silence(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    pub fn calls(&self) -> Vec<Step> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn head(&self, root: &Path) -> String {
        self.tree(root).head()
    }

    /// Patches compiled into the currently installed binaries
    pub fn installed(&self, root: &Path) -> Vec<String> {
        self.tree(root).installed
    }

    /// Simulate a hand edit of `path` in the checkout at `root`
    pub fn edit(&self, root: &Path, path: &str) {
        if let Some(tree) = self.state.lock().unwrap().trees.get_mut(root) {
            tree.edits.push(path.to_string());
        }
    }

    pub fn working(&self, root: &Path) -> Vec<String> {
        self.tree(root).working
    }

    fn tree(&self, root: &Path) -> Tree {
        self.state
            .lock()
            .unwrap()
            .trees
            .get(root)
            .cloned()
            .unwrap_or_default()
    }

    fn enter(&self, step: Step) -> Result<std::sync::MutexGuard<'_, FakeState>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(step);
        if state.failing.contains(&step) {
            bail!("injected {step} failure");
        }
        Ok(state)
    }
}

fn tree_mut<'a>(state: &'a mut FakeState, layout: &SandboxLayout) -> Result<&'a mut Tree> {
    state
        .trees
        .get_mut(layout.root())
        .ok_or_else(|| anyhow!("no checkout at {}", layout.root().display()))
}

impl Toolchain for FakeToolchain {
    fn preflight(&self) -> Result<()> {
        Ok(())
    }

    fn fetch(&self, layout: &SandboxLayout) -> Result<()> {
        let mut state = self.enter(Step::Clone)?;
        state.trees.insert(
            layout.root().to_path_buf(),
            Tree {
                commits: vec![Vec::new()],
                ..Tree::default()
            },
        );
        Ok(())
    }

    fn configure(&self, layout: &SandboxLayout) -> Result<()> {
        let mut state = self.enter(Step::Configure)?;
        tree_mut(&mut state, layout)?;
        Ok(())
    }

    fn build(&self, layout: &SandboxLayout) -> Result<()> {
        let mut state = self.enter(Step::Build)?;
        let tree = tree_mut(&mut state, layout)?;
        if tree.working.iter().any(|p| p.contains("NOBUILD")) {
            bail!("compile error in patched sources");
        }
        Ok(())
    }

    fn install(&self, layout: &SandboxLayout) -> Result<()> {
        let mut state = self.enter(Step::Install)?;
        let tree = tree_mut(&mut state, layout)?;
        tree.installed = tree.working.clone();
        Ok(())
    }

    fn init_storage(&self, layout: &SandboxLayout) -> Result<()> {
        let mut state = self.enter(Step::Initdb)?;
        tree_mut(&mut state, layout)?;
        Ok(())
    }

    fn start(&self, layout: &SandboxLayout, port: u16) -> Result<()> {
        let mut state = self.enter(Step::Start)?;
        let tree = tree_mut(&mut state, layout)?;
        if tree.installed.iter().any(|p| p.contains("NOSTART")) {
            bail!("postmaster exited during startup");
        }
        let answers = !tree.installed.iter().any(|p| p.contains("NOANSWER"));
        tree.running = Some(port);
        let answers = answers && !state.silent;
        if answers {
            state.alive.insert(port);
        }
        Ok(())
    }

    fn stop(&self, layout: &SandboxLayout, _mode: StopMode) -> Result<()> {
        let mut state = self.enter(Step::Stop)?;
        let tree = tree_mut(&mut state, layout)?;
        let Some(port) = tree.running.take() else {
            bail!("server is not running");
        };
        state.alive.remove(&port);
        Ok(())
    }

    fn head_revision(&self, layout: &SandboxLayout) -> Result<String> {
        let state = self.state.lock().unwrap();
        state
            .trees
            .get(layout.root())
            .map(Tree::head)
            .ok_or_else(|| anyhow!("no checkout"))
    }

    fn uncommitted_changes(&self, layout: &SandboxLayout) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        state
            .trees
            .get(layout.root())
            .map(|tree| tree.edits.clone())
            .ok_or_else(|| anyhow!("no checkout"))
    }

    fn check_patch(&self, layout: &SandboxLayout, patch: &Path) -> Result<()> {
        let text = std::fs::read_to_string(patch)?;
        let mut state = self.enter(Step::Check)?;
        tree_mut(&mut state, layout)?;
        if text.contains("BROKEN") {
            bail!("error: patch failed: src/backend/main.c:1");
        }
        Ok(())
    }

    fn apply_patch(&self, layout: &SandboxLayout, patch: &Path) -> Result<()> {
        let text = std::fs::read_to_string(patch)?;
        let mut state = self.enter(Step::Apply)?;
        tree_mut(&mut state, layout)?.working.push(text);
        Ok(())
    }

    fn commit(&self, layout: &SandboxLayout, _message: &str) -> Result<()> {
        let mut state = self.enter(Step::Commit)?;
        let tree = tree_mut(&mut state, layout)?;
        let snapshot = tree.working.clone();
        tree.commits.push(snapshot);
        Ok(())
    }

    fn reset(&self, layout: &SandboxLayout, revision: &str) -> Result<()> {
        let mut state = self.enter(Step::Reset)?;
        let tree = tree_mut(&mut state, layout)?;
        let n: usize = revision
            .trim_start_matches('r')
            .parse()
            .map_err(|_| anyhow!("unknown revision {revision}"))?;
        if n == 0 || n > tree.commits.len() {
            bail!("unknown revision {revision}");
        }
        tree.commits.truncate(n);
        tree.working = tree.commits[n - 1].clone();
        tree.edits.clear();
        Ok(())
    }
}

impl Prober for FakeToolchain {
    fn is_alive(&self, port: u16) -> bool {
        self.state.lock().unwrap().alive.contains(&port)
    }
}

/// Context over a fresh temp dir with the fake toolchain as both backends.
pub fn fixture() -> (tempfile::TempDir, SandboxContext, Arc<FakeToolchain>) {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config {
        work_dir: Some(tmp.path().join("work")),
        ..Config::default()
    };
    config.probe.attempts = 2;
    config.probe.interval_ms = 0;

    let fake = Arc::new(FakeToolchain::default());
    let ctx = SandboxContext::with_backends(
        config,
        &tmp.path().join("state"),
        fake.clone(),
        fake.clone(),
    );
    (tmp, ctx, fake)
}

use anyhow::{Context, Result, anyhow};
use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

/// How much of a failing command's stderr is kept in the error message.
const STDERR_TAIL_LINES: usize = 20;

/// A builder for executing external commands with unified error handling
pub struct Cmd<'a> {
    command: OsString,
    args: Vec<OsString>,
    workdir: Option<&'a Path>,
    envs: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl<'a> Cmd<'a> {
    /// Create a new command builder
    pub fn new(command: impl AsRef<OsStr>) -> Self {
        Self {
            command: command.as_ref().to_os_string(),
            args: Vec::new(),
            workdir: None,
            envs: Vec::new(),
            timeout: None,
        }
    }

    /// Add a single argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set the working directory for the command
    pub fn workdir(mut self, path: &'a Path) -> Self {
        self.workdir = Some(path);
        self
    }

    /// Set an environment variable for the child process
    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.envs.push((key.to_string(), value.into()));
        self
    }

    /// Kill the child and fail if it runs longer than `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn display(&self) -> String {
        std::iter::once(&self.command)
            .chain(self.args.iter())
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args).stdin(Stdio::null());
        if let Some(dir) = self.workdir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }

    /// Execute the command and collect its output, honoring the timeout.
    /// Does not look at the exit status.
    fn output(&self) -> Result<Output> {
        let shown = self.display();
        let mut cmd = self.build();

        let Some(timeout) = self.timeout else {
            return cmd
                .output()
                .with_context(|| format!("Failed to execute command: {}", shown));
        };

        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute command: {}", shown))?;

        // Drain both pipes while waiting so a chatty child cannot block on a full pipe
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match wait_or_kill(&mut child, timeout, &shown)? {
            Some(status) => status,
            None => {
                return Err(anyhow!(
                    "Command timed out after {}s: {}",
                    timeout.as_secs(),
                    shown
                ));
            }
        };

        Ok(Output {
            status,
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }

    /// Execute the command and return the output
    /// Returns an error if the command fails (non-zero exit code) or times out
    pub fn run(self) -> Result<Output> {
        let shown = self.display();
        let workdir_display = self.workdir.map(|p| p.display().to_string());
        trace!(command = %shown, workdir = ?workdir_display, timeout = ?self.timeout, "cmd:run start");

        let output = self.output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr_tail(&stderr);
            debug!(
                command = %shown,
                status = ?output.status.code(),
                stderr = %tail,
                "cmd:run failure"
            );
            return Err(anyhow!(
                "Command failed with exit code {}: {}\n{}",
                output.status.code().unwrap_or(-1),
                shown,
                tail
            ));
        }
        trace!(command = %shown, "cmd:run success");
        Ok(output)
    }

    /// Execute the command and return stdout as a trimmed string
    pub fn run_and_capture_stdout(self) -> Result<String> {
        let output = self.run()?;
        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Wait for the child up to `timeout`. Returns None after killing it on expiry.
fn wait_or_kill(child: &mut Child, timeout: Duration, shown: &str) -> Result<Option<ExitStatus>> {
    match child
        .wait_timeout(timeout)
        .with_context(|| format!("Failed to wait for command: {}", shown))?
    {
        Some(status) => Ok(Some(status)),
        None => {
            warn!(command = shown, secs = timeout.as_secs(), "cmd:timeout, killing");
            let _ = child.kill();
            let _ = child.wait();
            Ok(None)
        }
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_stdout() {
        let out = Cmd::new("sh")
            .args(["-c", "echo hello"])
            .run_and_capture_stdout()
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn run_passes_env_and_workdir() {
        let tmp = tempfile::tempdir().unwrap();
        let out = Cmd::new("sh")
            .args(["-c", "echo $PGSANDBOX_TEST_VAR; pwd"])
            .env("PGSANDBOX_TEST_VAR", "value")
            .workdir(tmp.path())
            .timeout(Duration::from_secs(10))
            .run_and_capture_stdout()
            .unwrap();
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("value"));
        let pwd = std::path::PathBuf::from(lines.next().unwrap());
        assert_eq!(
            pwd.canonicalize().unwrap(),
            tmp.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn run_fails_on_nonzero_exit_with_stderr() {
        let err = Cmd::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .run()
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"), "{msg}");
        assert!(msg.contains("broken"), "{msg}");
    }

    #[test]
    fn run_times_out() {
        let start = std::time::Instant::now();
        let err = Cmd::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(200))
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_binary_is_an_error() {
        assert!(Cmd::new("pgsandbox-definitely-missing-binary").run().is_err());
    }

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let text: String = (0..50).map(|i| format!("line{i}\n")).collect();
        let tail = stderr_tail(&text);
        assert!(tail.starts_with("line30"));
        assert!(tail.ends_with("line49"));
    }
}

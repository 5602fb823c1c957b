//! Typed JSON boundary for orchestrators.
//!
//! One request in, one response out. The set of requests is closed; anything
//! that does not deserialize into [`Request`] is rejected before touching a
//! sandbox.

use std::io::{IsTerminal, Read};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use super::list::{ListEntry, entries};
use crate::config;
use crate::error::{SandboxError, Step};
use crate::lifecycle::{self, Acquired, PatchReport, Provisioned, SandboxContext, StopReport};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Ensure {
        #[serde(default)]
        label: Option<String>,
    },
    New {
        label: String,
    },
    ApplyPatch {
        label: String,
        /// Unified diff text
        patch: String,
        /// Recorded in the sandbox commit message
        #[serde(default)]
        name: Option<String>,
    },
    List {
        #[serde(default)]
        probe: bool,
    },
    Stop {
        label: String,
        #[serde(default)]
        purge: bool,
    },
    StopAll {
        #[serde(default)]
        purge: bool,
    },
    SourceRoot {
        #[serde(default)]
        label: Option<String>,
    },
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::Ensure { .. } => "ensure",
            Request::New { .. } => "new",
            Request::ApplyPatch { .. } => "apply_patch",
            Request::List { .. } => "list",
            Request::Stop { .. } => "stop",
            Request::StopAll { .. } => "stop_all",
            Request::SourceRoot { .. } => "source_root",
        }
    }

    fn label(&self) -> Option<&str> {
        match self {
            Request::Ensure { label } | Request::SourceRoot { label } => label.as_deref(),
            Request::New { label }
            | Request::ApplyPatch { label, .. }
            | Request::Stop { label, .. } => Some(label.as_str()),
            Request::List { .. } | Request::StopAll { .. } => None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Sandbox(Acquired),
    Provisioned(Provisioned),
    Patched(PatchReport),
    Sandboxes {
        sandboxes: Vec<ListEntry>,
    },
    Stopped(StopReport),
    StoppedAll {
        stopped: Vec<StopReport>,
        failed: Vec<ErrorReport>,
    },
    SourceRoot {
        path: PathBuf,
    },
}

impl Response {
    /// True when the request only partly succeeded.
    pub fn has_failures(&self) -> bool {
        matches!(self, Response::StoppedAll { failed, .. } if !failed.is_empty())
    }
}

/// Machine-readable form of a [`SandboxError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub step: Option<Step>,
    pub label: Option<String>,
    pub message: String,
}

impl From<&SandboxError> for ErrorReport {
    fn from(err: &SandboxError) -> Self {
        Self {
            step: err.step(),
            label: err.label().map(str::to_string),
            message: err.to_string(),
        }
    }
}

/// Execute one request against `ctx`.
pub fn dispatch(ctx: &SandboxContext, request: Request) -> Result<Response, SandboxError> {
    match request {
        Request::Ensure { label } => lifecycle::ensure(ctx, label.as_deref()).map(Response::Sandbox),
        Request::New { label } => lifecycle::provision(ctx, &label).map(Response::Provisioned),
        Request::ApplyPatch { label, patch, name } => {
            let name = name.as_deref().unwrap_or("patch");
            lifecycle::apply_patch(ctx, &label, &patch, name).map(Response::Patched)
        }
        Request::List { probe } => Ok(Response::Sandboxes {
            sandboxes: entries(ctx, probe),
        }),
        Request::Stop { label, purge } => lifecycle::stop(ctx, &label, purge).map(Response::Stopped),
        Request::StopAll { purge } => {
            let mut stopped = Vec::new();
            let mut failed = Vec::new();
            for (label, result) in lifecycle::stop_all(ctx, purge) {
                match result {
                    Ok(report) => stopped.push(report),
                    Err(e) => {
                        let mut report = ErrorReport::from(&e);
                        if report.label.is_none() {
                            report.label = Some(label);
                        }
                        failed.push(report);
                    }
                }
            }
            Ok(Response::StoppedAll { stopped, failed })
        }
        Request::SourceRoot { label } => ctx
            .source_root(config::source_root_override(), label.as_deref())
            .map(|path| Response::SourceRoot { path }),
    }
}

/// Render a successful response with its `status` field.
fn ok_json(response: &Response) -> Result<Value> {
    let mut value = serde_json::to_value(response).context("Failed to serialize response")?;
    let status = if response.has_failures() { "error" } else { "ok" };
    value
        .as_object_mut()
        .ok_or_else(|| anyhow!("response did not serialize to an object"))?
        .insert("status".to_string(), json!(status));
    Ok(value)
}

fn error_json(report: &ErrorReport) -> Value {
    json!({
        "status": "error",
        "step": report.step,
        "label": report.label,
        "message": report.message,
    })
}

/// Parse and run one JSON request, printing a JSON reply. Returns the exit code.
pub fn run(input: &str) -> Result<i32> {
    let text = if input == "-" {
        if std::io::stdin().is_terminal() {
            return Err(anyhow!("No request on stdin. Pass JSON or pipe it in"));
        }
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read request from stdin")?;
        buf
    } else {
        input.to_string()
    };

    let request: Request = match serde_json::from_str(&text) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "call:invalid request");
            let report = ErrorReport {
                step: None,
                label: None,
                message: format!("invalid request: {e}"),
            };
            println!("{}", error_json(&report));
            return Ok(1);
        }
    };
    info!(command = request.name(), label = ?request.label(), "call:request");

    let ctx = match super::context() {
        Ok(ctx) => ctx,
        Err(e) => {
            let report = ErrorReport {
                step: None,
                label: request.label().map(str::to_string),
                message: format!("{e:#}"),
            };
            println!("{}", error_json(&report));
            return Ok(1);
        }
    };

    match dispatch(&ctx, request) {
        Ok(response) => {
            println!("{}", ok_json(&response)?);
            Ok(if response.has_failures() { 1 } else { 0 })
        }
        Err(e) => {
            warn!(error = %e, "call:failed");
            println!("{}", error_json(&ErrorReport::from(&e)));
            Ok(1)
        }
    }
}

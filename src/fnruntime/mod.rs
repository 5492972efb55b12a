//! Function runtimes: containerised processes, local executables, and
//! in-process built-ins.
//!
//! A runtime does exactly one thing: run one function invocation. Wire
//! runtimes (container, exec) take the serialised `ResourceList` on stdin
//! and hand back stdout/stderr/exit code; built-ins take parsed nodes
//! directly.

pub mod builtin;
pub mod container;
pub mod exec;
pub mod resourcelist;
pub mod runner;

use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, FnFailure, Result};
use crate::image::{ImageName, TagResolver};
use crate::pkg::manifest::Function;

/// Default wall-clock budget for one function invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// When to pull a function image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl FromStr for PullPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(PullPolicy::Always),
            "ifnotpresent" => Ok(PullPolicy::IfNotPresent),
            "never" => Ok(PullPolicy::Never),
            _ => Err(Error::Config(format!(
                "invalid image pull policy {:?} (expected Always, IfNotPresent or Never)",
                s
            ))),
        }
    }
}

/// Invocation permissions and knobs consumed from the caller.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub pull_policy: PullPolicy,
    pub allow_exec: bool,
    pub network_enabled: bool,
    pub as_current_user: bool,
    /// Storage mount descriptors (`type=bind,src=...,dst=...`).
    pub mounts: Vec<String>,
    pub timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            pull_policy: PullPolicy::default(),
            allow_exec: false,
            network_enabled: false,
            as_current_user: false,
            mounts: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Raw result of a wire runtime invocation. A non-zero exit code is not an
/// error at this layer; the runner decides after salvaging any structured
/// results from stdout.
#[derive(Debug)]
pub struct WireOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// One function's runtime target.
#[derive(Debug)]
pub enum FnRuntime {
    Container(container::ContainerFn),
    Exec(exec::ExecFn),
    Builtin(&'static builtin::BuiltinFn),
}

impl FnRuntime {
    /// Resolve a function spec to its runtime. Checks permissions, matches
    /// built-ins, and (for containers) resolves a version-constraint tag to
    /// a concrete one.
    pub async fn build(
        func: &Function,
        opts: &RuntimeOptions,
        resolver: &TagResolver,
    ) -> Result<FnRuntime> {
        if func.network && !opts.network_enabled {
            return Err(Error::Permission(format!(
                "function {:?} declares network: true, but networking is not enabled \
                 (pass --network)",
                func.identity()
            )));
        }

        if let Some(command) = &func.exec {
            if !opts.allow_exec {
                return Err(Error::Permission(format!(
                    "function {:?} requires --allow-exec",
                    command
                )));
            }
            return Ok(FnRuntime::Exec(exec::ExecFn::parse(
                command,
                resolve_env(&func.env),
                opts.timeout,
            )?));
        }

        let image = match &func.image {
            Some(image) => image,
            None => {
                return Err(Error::Config(
                    "function declares neither image nor exec".to_string(),
                ))
            }
        };
        let parsed = ImageName::parse(image)?;
        if let Some(b) = builtin::lookup(parsed.last_component()) {
            return Ok(FnRuntime::Builtin(b));
        }

        let image = resolver.resolve(image).await?;
        Ok(FnRuntime::Container(container::ContainerFn {
            image,
            network: func.network,
            as_current_user: opts.as_current_user,
            mounts: opts.mounts.clone(),
            env: resolve_env(&func.env),
            timeout: opts.timeout,
            pull_policy: opts.pull_policy,
        }))
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self, FnRuntime::Builtin(_))
    }

    pub fn is_container(&self) -> bool {
        matches!(self, FnRuntime::Container(_))
    }

    /// Run a wire runtime. Calling this on a built-in is a programming
    /// error; the runner dispatches built-ins separately.
    pub async fn run_wire(&self, input: &str, identity: &str) -> Result<WireOutput> {
        match self {
            FnRuntime::Container(c) => c.run(input).await,
            FnRuntime::Exec(e) => e.run(input).await,
            FnRuntime::Builtin(b) => Err(Error::Config(format!(
                "built-in {:?} has no wire runtime (function {:?})",
                b.name, identity
            ))),
        }
    }
}

/// Expand `KEY=VALUE` and bare `KEY` (pass-through) env declarations.
fn resolve_env(entries: &[String]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter_map(|entry| match entry.split_once('=') {
            Some((k, v)) => Some((k.to_string(), v.to_string())),
            None if !entry.is_empty() => {
                Some((entry.clone(), std::env::var(entry).unwrap_or_default()))
            }
            None => None,
        })
        .collect()
}

/// Spawn a child, feed it the input document, and collect its output under
/// the timeout. Dropping the future (cancellation, timeout) kills the
/// child.
pub(crate) async fn run_process(
    mut cmd: Command,
    input: &str,
    timeout: Duration,
    identity: &str,
) -> Result<WireOutput> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        Error::function(FnFailure {
            function: identity.to_string(),
            exit_code: -1,
            stderr: format!("failed to start: {}", e),
            results: vec![],
        })
    })?;

    // Write stdin concurrently with draining stdout/stderr so neither pipe
    // can fill and deadlock the child.
    let writer = child.stdin.take().map(|mut stdin| {
        let input = input.to_string();
        tokio::spawn(async move {
            let _ = stdin.write_all(input.as_bytes()).await;
        })
    });

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Err(_) => {
            return Err(Error::function(FnFailure {
                function: identity.to_string(),
                exit_code: -1,
                stderr: format!("timed out after {}s", timeout.as_secs()),
                results: vec![],
            }))
        }
        Ok(Err(e)) => {
            return Err(Error::function(FnFailure {
                function: identity.to_string(),
                exit_code: -1,
                stderr: format!("i/o failure: {}", e),
                results: vec![],
            }))
        }
        Ok(Ok(output)) => output,
    };
    if let Some(writer) = writer {
        let _ = writer.await;
    }

    Ok(WireOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

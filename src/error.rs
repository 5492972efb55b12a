//! Error types for the hydration engine.

use crate::results::ResultItem;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the hydration engine.
///
/// Every variant is fatal to the enclosing pipeline unless the failing
/// function declared `deferFailure: true`, in which case the failure is
/// downgraded to a recorded result and the input passes through unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed manifest, unknown function, exclusive-config violation,
    /// invalid image reference.
    #[error("configuration error: {0}")]
    Config(String),

    /// `exec` without `allow-exec`, or `network` without network permission.
    #[error("permission denied: {0}")]
    Permission(String),

    /// A function invocation failed: pull failure, timeout, non-zero exit.
    #[error(transparent)]
    Function(Box<FnFailure>),

    /// Infrastructure the engine depends on is unavailable or misbehaving:
    /// no container runtime, remote tag listing failed.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The function violated the wire protocol: unparseable output,
    /// duplicate `(path, index)`, path escaping the package, or a resource
    /// returned outside the function's selectors.
    #[error("function {function}: {message}")]
    Protocol { function: String, message: String },

    /// A sub-package dependency cycle.
    #[error("cycle through {0}")]
    Cycle(String),

    #[error("hydration cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn protocol(function: &str, message: impl Into<String>) -> Self {
        Error::Protocol {
            function: function.to_string(),
            message: message.into(),
        }
    }

    pub fn function(failure: FnFailure) -> Self {
        Error::Function(Box::new(failure))
    }
}

/// A failed function invocation, with everything needed for the
/// user-visible failure report.
#[derive(Debug, Error)]
#[error("function {function} failed (exit code {exit_code})")]
pub struct FnFailure {
    /// Function identity: image reference or exec command line.
    pub function: String,
    /// Exit code of the child process (-1 for timeout or spawn failure).
    pub exit_code: i32,
    /// Captured stderr, untruncated.
    pub stderr: String,
    /// Structured results the function managed to emit before failing.
    pub results: Vec<ResultItem>,
}

impl FnFailure {
    /// Format the failure for terminal output; the enclosing pipeline has
    /// already printed the package display path. Stderr is truncated to
    /// four lines unless `full_stderr` is set.
    pub fn render(&self, full_stderr: bool) -> String {
        const STDERR_LINES: usize = 4;

        let mut out = format!(
            "function \"{}\" failed with exit code {}\n",
            self.function, self.exit_code
        );
        if !self.stderr.is_empty() {
            let lines: Vec<&str> = self.stderr.lines().collect();
            let shown = if full_stderr {
                &lines[..]
            } else {
                &lines[lines.len().saturating_sub(STDERR_LINES)..]
            };
            if shown.len() < lines.len() {
                out.push_str("  stderr (truncated):\n");
            } else {
                out.push_str("  stderr:\n");
            }
            for line in shown {
                out.push_str("    ");
                out.push_str(line);
                out.push('\n');
            }
        }
        for item in &self.results {
            out.push_str(&format!("  [{}] {}\n", item.severity, item.message));
        }
        out
    }
}

//! Local-executable function runtime. Same wire contract as the container
//! runtime, but runs an arbitrary binary on the host; callers must opt in
//! with `allow-exec`.

use std::time::Duration;

use tokio::process::Command;

use crate::error::{Error, Result};
use crate::fnruntime::{run_process, WireOutput};

#[derive(Debug)]
pub struct ExecFn {
    /// Original command line, for display.
    pub command: String,
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    timeout: Duration,
}

impl ExecFn {
    /// Tokenise the declared command line.
    pub fn parse(command: &str, env: Vec<(String, String)>, timeout: Duration) -> Result<ExecFn> {
        let tokens = shell_words::split(command)
            .map_err(|e| Error::Config(format!("exec {:?}: {}", command, e)))?;
        let (program, args) = match tokens.split_first() {
            Some((p, rest)) => (p.clone(), rest.to_vec()),
            None => return Err(Error::Config("exec command line is empty".to_string())),
        };
        Ok(ExecFn {
            command: command.to_string(),
            program,
            args,
            env,
            timeout,
        })
    }

    pub async fn run(&self, input: &str) -> Result<WireOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        run_process(cmd, input, self.timeout, &self.command).await
    }
}

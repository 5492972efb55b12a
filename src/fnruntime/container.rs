//! Containerised function runtime.
//!
//! Launches the declared image through the `docker` CLI with a restrictive
//! posture: no network unless the function declared (and the caller
//! allowed) one, no privilege escalation, and a non-root user unless the
//! caller opted into their own uid/gid. The image is checked locally and
//! pulled ahead of the invocation according to the pull policy.

use std::time::Duration;

use tokio::process::Command;

use crate::error::{Error, FnFailure, Result};
use crate::fnruntime::{run_process, PullPolicy, WireOutput};

const DOCKER: &str = "docker";

/// One container function, fully resolved (concrete tag, merged
/// permissions).
#[derive(Debug)]
pub struct ContainerFn {
    pub image: String,
    pub network: bool,
    pub as_current_user: bool,
    pub mounts: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    pub pull_policy: PullPolicy,
}

impl ContainerFn {
    /// Make sure the image is locally available, per the pull policy.
    pub async fn ensure_image(&self) -> Result<()> {
        match self.pull_policy {
            PullPolicy::Always => self.pull().await,
            PullPolicy::IfNotPresent => {
                if self.image_present().await? {
                    Ok(())
                } else {
                    self.pull().await
                }
            }
            PullPolicy::Never => {
                if self.image_present().await? {
                    Ok(())
                } else {
                    Err(Error::Config(format!(
                        "image {:?} is not present locally and the pull policy is Never",
                        self.image
                    )))
                }
            }
        }
    }

    pub async fn run(&self, input: &str) -> Result<WireOutput> {
        self.ensure_image().await?;
        let mut cmd = Command::new(DOCKER);
        cmd.args(self.run_args());
        run_process(cmd, input, self.timeout, &self.image).await
    }

    fn run_args(&self) -> Vec<String> {
        let network = if self.network { "bridge" } else { "none" };
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--network".to_string(),
            network.to_string(),
            "--security-opt=no-new-privileges".to_string(),
            "--read-only".to_string(),
        ];
        match (self.as_current_user, current_uid_gid()) {
            (true, Some((uid, gid))) => {
                args.push("--user".to_string());
                args.push(format!("{}:{}", uid, gid));
            }
            (true, None) => {}
            (false, _) => {
                args.push("--user".to_string());
                args.push("nobody".to_string());
            }
        }
        for mount in &self.mounts {
            args.push("--mount".to_string());
            args.push(mount.clone());
        }
        for (k, v) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }
        args.push(self.image.clone());
        args
    }

    async fn image_present(&self) -> Result<bool> {
        let output = Command::new(DOCKER)
            .args(["image", "ls", &self.image, "--format", "{{.Repository}}:{{.Tag}}"])
            .output()
            .await
            .map_err(|e| Error::Runtime(format!("container runtime unavailable: {}", e)))?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    async fn pull(&self) -> Result<()> {
        tracing::info!(image = %self.image, "pulling function image");
        let output = Command::new(DOCKER)
            .args(["pull", &self.image])
            .output()
            .await
            .map_err(|e| Error::Runtime(format!("container runtime unavailable: {}", e)))?;
        if !output.status.success() {
            return Err(Error::function(FnFailure {
                function: self.image.clone(),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                results: vec![],
            }));
        }
        Ok(())
    }
}

/// Check once per hydration that a container runtime answers at all.
pub async fn check_runtime_available() -> Result<()> {
    let output = Command::new(DOCKER)
        .args(["version", "--format", "{{.Client.Version}}"])
        .output()
        .await
        .map_err(|e| Error::Runtime(format!("container runtime unavailable: {}", e)))?;
    if !output.status.success() {
        return Err(Error::Runtime(format!(
            "container runtime unavailable: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn current_uid_gid() -> Option<(u32, u32)> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata("/proc/self").ok()?;
    Some((meta.uid(), meta.gid()))
}

#[cfg(not(unix))]
fn current_uid_gid() -> Option<(u32, u32)> {
    None
}

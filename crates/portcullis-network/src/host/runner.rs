//! Configuration command runner.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use portcullis_common::{PortcullisError, PortcullisPaths, PortcullisResult};
use tokio::process::Command;

use crate::platform::{CommandRunner, container_not_found};

/// Runs commands on the host, or in a container's named network namespace
/// through `ip netns exec`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    netns_dir: PathBuf,
    timeout: Duration,
}

impl ShellRunner {
    /// Create a runner bounding each command by `timeout`.
    #[must_use]
    pub fn new(paths: &PortcullisPaths, timeout: Duration) -> Self {
        Self {
            netns_dir: paths.netns.clone(),
            timeout,
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> PortcullisResult<String> {
        let command = command_line(program, args);
        tracing::debug!(command = %command, "Running command");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(program).args(args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| PortcullisError::CommandFailed {
            command: command.clone(),
            message: format!("timed out after {}s", self.timeout.as_secs()),
        })?
        .map_err(|e| PortcullisError::CommandFailed {
            command: command.clone(),
            message: format!("failed to execute: {e}"),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                output.status.to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(PortcullisError::CommandFailed { command, message });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run_host(&self, program: &str, args: &[String]) -> PortcullisResult<String> {
        self.run(program, args).await
    }

    async fn run_container(
        &self,
        container_id: &str,
        program: &str,
        args: &[String],
    ) -> PortcullisResult<String> {
        if !self.netns_dir.join(container_id).exists() {
            return Err(container_not_found(container_id));
        }

        let mut netns_args = vec![
            "netns".to_string(),
            "exec".to_string(),
            container_id.to_string(),
            program.to_string(),
        ];
        netns_args.extend_from_slice(args);
        self.run("ip", &netns_args).await
    }
}

/// Render a command for logs and errors.
pub(crate) fn command_line(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    }
}

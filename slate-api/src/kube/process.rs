use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{CommandOutput, DriverError, KubeDriver};

/// Driver that runs `kubectl` and `helm` as subprocesses.
///
/// Processes are spawned with piped stdio and `kill_on_drop` so that a
/// cancelled request tears down its child instead of leaking it.
pub struct ProcessKubeDriver {
    kubectl_path: String,
    helm_path: String,
}

impl ProcessKubeDriver {
    pub fn new() -> Self {
        Self {
            kubectl_path: "kubectl".to_string(),
            helm_path: "helm".to_string(),
        }
    }

    /// Overrides the binary paths, for hosts where they are not on `PATH`.
    pub fn with_binaries(kubectl_path: String, helm_path: String) -> Self {
        Self {
            kubectl_path,
            helm_path,
        }
    }

    async fn run(&self, program: &str, mut command: Command) -> Result<CommandOutput, DriverError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = command.output().await.map_err(|source| DriverError::Launch {
            command: program.to_string(),
            source,
        })?;

        let result = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(program, status = result.status, "external command finished");

        Ok(result)
    }
}

impl Default for ProcessKubeDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KubeDriver for ProcessKubeDriver {
    async fn kubectl(
        &self,
        config_path: &Path,
        args: &[&str],
    ) -> Result<CommandOutput, DriverError> {
        let mut command = Command::new(&self.kubectl_path);
        command.args(args);
        command.arg(format!("--kubeconfig={}", config_path.display()));

        self.run(&self.kubectl_path, command).await
    }

    async fn helm(
        &self,
        config_path: &Path,
        tiller_namespace: &str,
        args: &[&str],
    ) -> Result<CommandOutput, DriverError> {
        let mut command = Command::new(&self.helm_path);
        command.args(args);
        command.args(["--tiller-namespace", tiller_namespace]);
        command.env("KUBECONFIG", config_path);

        self.run(&self.helm_path, command).await
    }

    async fn helm_host(&self, args: &[&str]) -> Result<CommandOutput, DriverError> {
        let mut command = Command::new(&self.helm_path);
        command.args(args);

        self.run(&self.helm_path, command).await
    }
}

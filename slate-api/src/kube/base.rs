use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

/// Errors emitted by the kube driver.
///
/// These cover failures to run the external binaries at all; a binary that
/// runs and exits non-zero is reported through [`CommandOutput::status`]
/// instead, since callers routinely need the stderr text.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The external binary could not be launched or its output collected.
    #[error("Failed to run {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured result of a `kubectl` or `helm` invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Process exit code; `-1` if the process was killed by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Driver interface over the `kubectl` and `helm` binaries.
///
/// Implementations must not interpret arguments; they receive tokenized
/// argument vectors and return the raw process output.
#[async_trait]
pub trait KubeDriver: Send + Sync {
    /// Runs `kubectl` against the cluster described by `config_path`.
    async fn kubectl(
        &self,
        config_path: &Path,
        args: &[&str],
    ) -> Result<CommandOutput, DriverError>;

    /// Runs `helm` against the cluster described by `config_path`.
    ///
    /// The Tiller namespace is appended as `--tiller-namespace`; callers pass
    /// only the subcommand and its own flags.
    async fn helm(
        &self,
        config_path: &Path,
        tiller_namespace: &str,
        args: &[&str],
    ) -> Result<CommandOutput, DriverError>;

    /// Runs `helm` on the service host without a cluster kubeconfig.
    ///
    /// Catalog operations (`search`, `inspect`, `repo`) work purely against
    /// the host's repository cache.
    async fn helm_host(&self, args: &[&str]) -> Result<CommandOutput, DriverError>;

    /// Deletes a tenant namespace on the cluster.
    async fn delete_namespace(
        &self,
        config_path: &Path,
        namespace: &str,
    ) -> Result<CommandOutput, DriverError> {
        self.kubectl(config_path, &["delete", "namespace", namespace])
            .await
    }
}

/// Ensures a tenant namespace exists on the cluster, creating it if needed.
///
/// Creation races are benign: an `AlreadyExists` failure from a concurrent
/// create is treated as success.
pub async fn ensure_namespace(
    driver: &dyn KubeDriver,
    config_path: &Path,
    namespace: &str,
) -> Result<CommandOutput, DriverError> {
    let existing = driver
        .kubectl(config_path, &["get", "namespace", namespace])
        .await?;
    if existing.success() {
        return Ok(existing);
    }

    let created = driver
        .kubectl(config_path, &["create", "namespace", namespace])
        .await?;
    if !created.success() && created.stderr.contains("AlreadyExists") {
        return Ok(CommandOutput {
            status: 0,
            stdout: created.stdout,
            stderr: created.stderr,
        });
    }
    Ok(created)
}

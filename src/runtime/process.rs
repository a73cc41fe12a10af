// ABOUTME: Process-backed instance runtime using tokio::process.
// ABOUTME: Launches the configured shell command with CUTOVER_* environment variables.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{InstanceRuntime, RuntimeError};
use crate::types::Version;

/// Runs each instance as a local child process.
///
/// The launch command is a shell snippet from the configuration; the
/// runtime injects `CUTOVER_PORT`, `CUTOVER_VERSION`, and
/// `CUTOVER_ARTIFACT` into its environment, mirroring how deploy hooks
/// receive their context.
pub struct ProcessRuntime {
    command: String,
    artifact_dir: PathBuf,
    children: Mutex<HashMap<u16, Child>>,
    staged: Mutex<HashMap<u16, PathBuf>>,
}

impl ProcessRuntime {
    pub fn new(command: impl Into<String>, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            artifact_dir: artifact_dir.into(),
            children: Mutex::new(HashMap::new()),
            staged: Mutex::new(HashMap::new()),
        }
    }

    /// Where the staged artifact for `port` lives.
    fn slot_path(&self, port: u16) -> PathBuf {
        self.artifact_dir.join(format!("instance-{port}"))
    }
}

#[async_trait]
impl InstanceRuntime for ProcessRuntime {
    async fn stage_artifact(
        &self,
        artifact: &Path,
        version: &Version,
        port: u16,
    ) -> Result<(), RuntimeError> {
        let slot = self.slot_path(port);
        tokio::fs::create_dir_all(&slot).await?;

        let file_name = artifact
            .file_name()
            .ok_or_else(|| RuntimeError::ArtifactStaging(format!("not a file: {artifact:?}")))?;
        let dest = slot.join(file_name);
        tokio::fs::copy(artifact, &dest).await.map_err(|e| {
            RuntimeError::ArtifactStaging(format!("copy {artifact:?} -> {dest:?}: {e}"))
        })?;

        tracing::debug!(port, %version, dest = %dest.display(), "staged artifact");
        self.staged.lock().await.insert(port, dest);
        Ok(())
    }

    async fn start_instance(&self, port: u16, version: &Version) -> Result<(), RuntimeError> {
        let mut children = self.children.lock().await;
        if children.contains_key(&port) {
            return Err(RuntimeError::StartFailed {
                port,
                reason: "instance already running".to_string(),
            });
        }

        let artifact = self
            .staged
            .lock()
            .await
            .get(&port)
            .cloned()
            .unwrap_or_else(|| self.slot_path(port));

        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("CUTOVER_PORT", port.to_string())
            .env("CUTOVER_VERSION", version.to_string())
            .env("CUTOVER_ARTIFACT", &artifact)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RuntimeError::StartFailed {
                port,
                reason: e.to_string(),
            })?;

        tracing::info!(port, %version, pid = ?child.id(), "started instance");
        children.insert(port, child);
        Ok(())
    }

    async fn stop_instance(
        &self,
        port: u16,
        graceful_timeout: Duration,
    ) -> Result<(), RuntimeError> {
        let mut child = self
            .children
            .lock()
            .await
            .remove(&port)
            .ok_or(RuntimeError::NotRunning(port))?;

        // Graceful first: SIGTERM via kill(1), since tokio's kill() is SIGKILL.
        if let Some(pid) = child.id() {
            let _ = Command::new("kill")
                .arg(pid.to_string())
                .status()
                .await
                .map_err(|e| tracing::debug!(port, error = %e, "SIGTERM delivery failed"));
        }

        match tokio::time::timeout(graceful_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(port, %status, "instance exited gracefully");
                Ok(())
            }
            Ok(Err(e)) => Err(RuntimeError::StopFailed {
                port,
                reason: e.to_string(),
            }),
            Err(_elapsed) => {
                tracing::warn!(port, "graceful stop timed out, killing");
                child.kill().await.map_err(|e| RuntimeError::StopFailed {
                    port,
                    reason: format!("kill after timeout: {e}"),
                })?;
                Ok(())
            }
        }
    }

    async fn is_running(&self, port: u16) -> bool {
        let mut children = self.children.lock().await;
        match children.get_mut(&port) {
            None => false,
            Some(child) => match child.try_wait() {
                // Reap exited children lazily.
                Ok(Some(_)) => {
                    children.remove(&port);
                    false
                }
                Ok(None) => true,
                Err(_) => false,
            },
        }
    }
}

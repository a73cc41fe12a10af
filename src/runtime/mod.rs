// ABOUTME: Instance runtime abstraction - how application instances are launched and stopped.
// ABOUTME: The orchestrator only knows "start/stop an instance on a port"; this trait owns the rest.

mod process;

pub use process::ProcessRuntime;

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::types::Version;

/// Errors from instance lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to start instance on port {port}: {reason}")]
    StartFailed { port: u16, reason: String },

    #[error("no instance running on port {0}")]
    NotRunning(u16),

    #[error("failed to stop instance on port {port}: {reason}")]
    StopFailed { port: u16, reason: String },

    #[error("failed to stage artifact: {0}")]
    ArtifactStaging(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability for supervising application instances.
///
/// Implementations own the actual process-management mechanism; the
/// deployment managers only drive the lifecycle. A stop must attempt a
/// graceful termination first and escalate to a hard kill once
/// `graceful_timeout` elapses.
#[async_trait]
pub trait InstanceRuntime: Send + Sync {
    /// Make the artifact for `version` available to the instance on `port`.
    /// Called before (re)starting the instance with a new version.
    async fn stage_artifact(
        &self,
        artifact: &Path,
        version: &Version,
        port: u16,
    ) -> Result<(), RuntimeError>;

    /// Launch an instance serving on `port`.
    async fn start_instance(&self, port: u16, version: &Version) -> Result<(), RuntimeError>;

    /// Stop the instance on `port`: graceful signal, then a hard kill
    /// once `graceful_timeout` elapses. Idempotent for stopped instances
    /// only in the sense that the caller sees `NotRunning`.
    async fn stop_instance(&self, port: u16, graceful_timeout: Duration)
    -> Result<(), RuntimeError>;

    /// Whether an instance process is currently tracked on `port`.
    async fn is_running(&self, port: u16) -> bool;
}

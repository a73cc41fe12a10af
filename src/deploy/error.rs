// ABOUTME: Error taxonomy for the deployment pipeline.
// ABOUTME: Validation aborts before mutation; pipeline failures transition state.

use crate::bluegreen::BlueGreenError;
use crate::health::ProbeError;
use crate::rolling::RollingError;
use crate::runtime::RuntimeError;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Artifact missing or malformed, or a required pre-check failed.
    /// Raised before any mutation.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("deployment already in progress")]
    AlreadyInProgress,

    #[error("required check '{name}' failed: {message}")]
    RequiredCheckFailed { name: String, message: String },

    #[error("backup failed: {0}")]
    Backup(String),

    #[error("canary failed health checks: {0}")]
    CanaryFailed(String),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Rolling(#[from] RollingError),

    #[error(transparent)]
    BlueGreen(#[from] BlueGreenError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("deployment not found: {0}")]
    NotFound(String),

    #[error("no rollback target available")]
    NoRollbackTarget,

    #[error("deployment already rolled back")]
    AlreadyRolledBack,

    #[error("rollback failed: {0}")]
    RollbackFailed(String),
}

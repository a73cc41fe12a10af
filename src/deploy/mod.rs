// ABOUTME: The deployment pipeline: records, checks, backups, and the manager
// ABOUTME: that drives validate -> backup -> checks -> strategy -> checks -> done.

mod backup;
mod checks;
mod error;
mod manager;
mod model;

pub use backup::{BackupError, BackupManager};
pub use checks::{CHECK_RETRY_BACKOFF, ChecksOutcome, run_check, run_checks};
pub use error::DeployError;
pub use manager::{DeploymentManager, TOTAL_STEPS};
pub use model::{
    CheckResult, CheckStatus, Deployment, DeploymentHistory, DeploymentStatus, HISTORY_LIMIT,
    Instance, InstanceStatus, LOG_LIMIT, LogEntry,
};

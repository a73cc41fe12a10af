// ABOUTME: Drives one deployment at a time through the fixed pipeline and
// ABOUTME: owns the live record, history ring, and rollback bookkeeping.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use super::backup::BackupManager;
use super::checks::run_checks;
use super::error::DeployError;
use super::model::{Deployment, DeploymentHistory, DeploymentStatus};
use crate::bluegreen::BlueGreenDeployment;
use crate::config::{Config, Strategy};
use crate::events::{Event, EventBus};
use crate::health::{HealthProbe, PROBE_INTERVAL, ProbeOutcome};
use crate::rolling::{RollingError, RollingUpdateManager};
use crate::types::{DeploymentId, Version};

/// Pipeline steps: validate, backup, pre-checks, strategy, post-checks,
/// finalize.
pub const TOTAL_STEPS: u32 = 6;

/// Traffic percentages the canary ramp walks through after observation.
const RAMP_STEPS: [u8; 4] = [25, 50, 75, 100];

struct PipelineFailure {
    error: DeployError,
    /// Whether instances or environments were already touched, i.e.
    /// whether an automatic rollback makes sense.
    needs_rollback: bool,
}

impl PipelineFailure {
    fn before_mutation(error: DeployError) -> Self {
        Self {
            error,
            needs_rollback: false,
        }
    }

    fn after_mutation(error: DeployError) -> Self {
        Self {
            error,
            needs_rollback: true,
        }
    }
}

/// One deployment at a time; terminal records move to the history ring.
pub struct DeploymentManager {
    config: Config,
    events: EventBus,
    probe: HealthProbe,
    rolling: Arc<RollingUpdateManager>,
    blue_green: Option<Arc<BlueGreenDeployment>>,
    active: Mutex<Option<Deployment>>,
    history: Mutex<DeploymentHistory>,
    current_version: Mutex<Option<Version>>,
}

impl DeploymentManager {
    pub fn new(
        config: Config,
        events: EventBus,
        rolling: Arc<RollingUpdateManager>,
        blue_green: Option<Arc<BlueGreenDeployment>>,
    ) -> Self {
        let probe = HealthProbe::new(config.health.path.clone(), config.health.timeout);
        Self {
            config,
            events,
            probe,
            rolling,
            blue_green,
            active: Mutex::new(None),
            history: Mutex::new(DeploymentHistory::new()),
            current_version: Mutex::new(None),
        }
    }

    /// Seed the version the pool is currently running, when the
    /// orchestrator started it outside a deployment.
    pub fn set_current_version(&self, version: Version) {
        *self.current_version.lock() = Some(version);
    }

    pub fn current_version(&self) -> Option<Version> {
        self.current_version.lock().clone()
    }

    /// Rehydrate the history ring and version bookkeeping from persisted
    /// state. Replaces whatever is already recorded.
    pub fn restore(&self, history: Vec<Deployment>, current_version: Option<Version>) {
        let mut ring = self.history.lock();
        *ring = DeploymentHistory::new();
        for record in history {
            ring.archive(record);
        }
        *self.current_version.lock() = current_version;
    }

    /// Run the full pipeline for `version`. Rejected while another
    /// deployment is still in flight.
    pub async fn deploy(
        &self,
        artifact: &Path,
        version: Version,
    ) -> Result<DeploymentId, DeployError> {
        let from = self.current_version();

        let id = {
            let mut active = self.active.lock();
            if let Some(current) = active.as_ref()
                && !current.status.is_terminal()
            {
                return Err(DeployError::AlreadyInProgress);
            }

            let mut deployment = Deployment::new(
                self.config.strategy,
                from.clone(),
                version.clone(),
                TOTAL_STEPS,
            );
            deployment.status = DeploymentStatus::InProgress;
            let id = deployment.id.clone();
            // Terminal records are archived on the way out of deploy() and
            // rollback(), so the slot is free here.
            *active = Some(deployment);
            id
        };

        tracing::info!(deployment = %id, %version, strategy = %self.config.strategy, "deployment started");
        self.events.emit(Event::DeploymentStarted {
            id: id.clone(),
            strategy: self.config.strategy.to_string(),
            from: from.clone(),
            to: version.clone(),
        });

        let result = match self
            .run_pipeline(&id, artifact, from.as_ref(), &version)
            .await
        {
            Ok(()) => {
                let can_roll_back = from.is_some();
                self.with_deployment(&id, |d| {
                    d.rollback_available = can_roll_back;
                    d.finish(DeploymentStatus::Completed);
                });
                *self.current_version.lock() = Some(version);
                tracing::info!(deployment = %id, "deployment completed");
                self.events.emit(Event::DeploymentCompleted { id: id.clone() });
                Ok(id)
            }
            Err(failure) => {
                self.handle_failure(&id, from.as_ref(), failure.needs_rollback, &failure.error)
                    .await;
                Err(failure.error)
            }
        };

        self.archive_live();
        result
    }

    /// Terminal records move to the history ring; the live pointer only
    /// ever holds an unfinished deployment.
    fn archive_live(&self) {
        let record = {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(d) if d.status.is_terminal() => active.take(),
                _ => None,
            }
        };
        if let Some(record) = record {
            self.history.lock().archive(record);
        }
    }

    async fn run_pipeline(
        &self,
        id: &DeploymentId,
        artifact: &Path,
        from: Option<&Version>,
        version: &Version,
    ) -> Result<(), PipelineFailure> {
        self.begin_step(id, "Validating artifact");
        self.validate_artifact(id, artifact, version)
            .await
            .map_err(PipelineFailure::before_mutation)?;
        self.run_validation_checks(id)
            .await
            .map_err(PipelineFailure::before_mutation)?;
        self.complete_step(id, "Validating artifact");

        self.begin_step(id, "Creating backup");
        self.create_backup(id)
            .await
            .map_err(PipelineFailure::before_mutation)?;
        self.complete_step(id, "Creating backup");

        self.begin_step(id, "Running pre-deployment checks");
        self.run_check_phase(id, &self.config.pre_deployment_checks)
            .await
            .map_err(PipelineFailure::before_mutation)?;
        self.complete_step(id, "Running pre-deployment checks");

        let strategy_step = format!("Executing {} strategy", self.config.strategy);
        self.begin_step(id, &strategy_step);
        self.run_strategy(id, artifact, from, version)
            .await
            .map_err(PipelineFailure::after_mutation)?;
        self.complete_step(id, &strategy_step);

        self.begin_step(id, "Running post-deployment checks");
        self.run_check_phase(id, &self.config.post_deployment_checks)
            .await
            .map_err(PipelineFailure::after_mutation)?;
        self.complete_step(id, "Running post-deployment checks");

        self.begin_step(id, "Finalizing");
        self.with_deployment(id, |d| {
            d.instances = self.rolling.pool_snapshot();
            d.log("deployment finished");
        });
        self.complete_step(id, "Finalizing");
        Ok(())
    }

    /// The artifact must exist; a directory artifact carrying a
    /// manifest.json gets its fields cross-checked (absent fields and a
    /// version mismatch are warnings, not errors).
    async fn validate_artifact(
        &self,
        id: &DeploymentId,
        artifact: &Path,
        version: &Version,
    ) -> Result<(), DeployError> {
        let metadata = tokio::fs::metadata(artifact).await.map_err(|_| {
            DeployError::Validation(format!("artifact not found: {}", artifact.display()))
        })?;

        if metadata.is_dir() {
            let manifest = artifact.join("manifest.json");
            if manifest.exists() {
                let content = tokio::fs::read_to_string(&manifest).await.map_err(|e| {
                    DeployError::Validation(format!("unreadable manifest.json: {e}"))
                })?;
                let parsed: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
                    DeployError::Validation(format!("malformed manifest.json: {e}"))
                })?;
                for field in ["service", "version"] {
                    if parsed.get(field).is_none() {
                        tracing::warn!(field, "manifest.json is missing an expected field");
                        self.with_deployment(id, |d| {
                            d.log(format!("warning: manifest.json missing field '{field}'"));
                        });
                    }
                }
                if let Some(manifest_version) = parsed.get("version").and_then(|v| v.as_str())
                    && manifest_version != version.as_str()
                {
                    tracing::warn!(
                        manifest = manifest_version,
                        requested = %version,
                        "manifest version does not match requested version"
                    );
                    self.with_deployment(id, |d| {
                        d.log(format!(
                            "warning: manifest version {manifest_version} != requested {version}"
                        ));
                    });
                }
            }
        }
        Ok(())
    }

    /// The validation step runs the configured pre-deployment checks too;
    /// the dedicated pre-check step repeats them right before the strategy
    /// executes, so a dependency that degrades in between is still caught.
    async fn run_validation_checks(&self, id: &DeploymentId) -> Result<(), DeployError> {
        let outcome = run_checks(&self.config.pre_deployment_checks).await;
        self.with_deployment(id, |d| d.checks.extend(outcome.results.iter().cloned()));
        match outcome.required_failure {
            Some((name, message)) => Err(DeployError::Validation(format!(
                "required check '{name}' failed: {message}"
            ))),
            None => Ok(()),
        }
    }

    async fn create_backup(&self, id: &DeploymentId) -> Result<(), DeployError> {
        let Some(backup_config) = self.config.backup.clone().filter(|b| b.enabled) else {
            self.with_deployment(id, |d| d.log("backup disabled, skipping"));
            return Ok(());
        };

        let dir = BackupManager::new(backup_config)
            .create()
            .await
            .map_err(|e| DeployError::Backup(e.to_string()))?;
        self.with_deployment(id, |d| d.log(format!("backup created at {}", dir.display())));
        Ok(())
    }

    async fn run_check_phase(
        &self,
        id: &DeploymentId,
        checks: &[crate::config::CheckConfig],
    ) -> Result<(), DeployError> {
        let outcome = run_checks(checks).await;
        self.with_deployment(id, |d| d.checks.extend(outcome.results.iter().cloned()));
        match outcome.required_failure {
            Some((name, message)) => Err(DeployError::RequiredCheckFailed { name, message }),
            None => Ok(()),
        }
    }

    async fn run_strategy(
        &self,
        id: &DeploymentId,
        artifact: &Path,
        from: Option<&Version>,
        version: &Version,
    ) -> Result<(), DeployError> {
        match self.config.strategy {
            Strategy::RollingUpdate => {
                if from.is_none() {
                    self.rolling.initialize_pool(&self.config.instances, version);
                    self.rolling
                        .start_pool(Some(&artifact.to_path_buf()), version)
                        .await?;
                } else {
                    self.rolling
                        .update_pool(&artifact.to_path_buf(), from, version)
                        .await?;
                }
                Ok(())
            }
            Strategy::BlueGreen => {
                let blue_green = self
                    .blue_green
                    .as_ref()
                    .ok_or_else(|| DeployError::Validation("blue-green not initialized".into()))?;
                blue_green.deploy(artifact, version).await?;
                Ok(())
            }
            Strategy::Canary => self.canary_rollout(id, artifact, from, version).await,
        }
    }

    /// Canary: update ~10% of the pool, observe it for a window, ramp the
    /// announced traffic share, then promote the rest of the pool.
    async fn canary_rollout(
        &self,
        id: &DeploymentId,
        artifact: &Path,
        from: Option<&Version>,
        version: &Version,
    ) -> Result<(), DeployError> {
        let Some(from) = from else {
            // Nothing to compare against on a first start; bring the whole
            // pool up directly.
            self.rolling.initialize_pool(&self.config.instances, version);
            self.rolling
                .start_pool(Some(&artifact.to_path_buf()), version)
                .await?;
            return Ok(());
        };

        let pool_size = self.config.instances.len();
        let canary_count = pool_size.div_ceil(10).max(1);
        let canary_indices: Vec<usize> = (0..canary_count).collect();
        let rest_indices: Vec<usize> = (canary_count..pool_size).collect();

        self.rolling.register_artifact(version, artifact);
        tracing::info!(deployment = %id, canary = canary_count, pool = pool_size, "deploying canary set");
        self.with_deployment(id, |d| {
            d.log(format!("canary: updating {canary_count} of {pool_size} instances"));
        });

        self.rolling
            .update_indices(&canary_indices, Some(from), version)
            .await?;

        let addrs: Vec<String> = {
            let pool = self.rolling.pool_snapshot();
            canary_indices
                .iter()
                .filter_map(|&i| pool.get(i).map(|inst| inst.addr()))
                .collect()
        };

        if let Err(reason) = self.observe_canary(&addrs).await {
            tracing::warn!(deployment = %id, %reason, "canary observation failed, reverting canary set");
            if self.config.rollback_on_failure
                && let Err(e) = self.rolling.update_indices(&canary_indices, None, from).await
            {
                tracing::error!(error = %e, "canary revert left instances unhealthy");
            }
            return Err(DeployError::CanaryFailed(reason));
        }

        for percent in RAMP_STEPS {
            self.events.emit(Event::CanaryTrafficRamp {
                id: id.clone(),
                percent,
            });
            self.with_deployment(id, |d| d.log(format!("canary traffic at {percent}%")));
            if percent != 100 && !self.config.canary.ramp_delay.is_zero() {
                tokio::time::sleep(self.config.canary.ramp_delay).await;
            }
        }

        if !rest_indices.is_empty() {
            self.rolling
                .update_indices(&rest_indices, Some(from), version)
                .await?;
        }
        Ok(())
    }

    /// Probe every canary instance on the regular interval for the whole
    /// observation window; any non-healthy answer aborts.
    async fn observe_canary(&self, addrs: &[String]) -> Result<(), String> {
        let window = self.config.canary.observation_window;
        let started = Instant::now();
        loop {
            for addr in addrs {
                if self.probe.check(addr).await != ProbeOutcome::Healthy {
                    return Err(format!("{addr} failed health check during observation"));
                }
            }
            if started.elapsed() >= window {
                return Ok(());
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }

    async fn handle_failure(
        &self,
        id: &DeploymentId,
        from: Option<&Version>,
        needs_rollback: bool,
        error: &DeployError,
    ) {
        let label = format!("Failed: {error}");
        self.with_deployment(id, |d| {
            d.current_step = label;
            d.log(format!("failed: {error}"));
            d.finish(DeploymentStatus::Failed);
        });
        self.events.emit(Event::DeploymentFailed {
            id: id.clone(),
            error: error.to_string(),
        });

        // The rolling manager already restored the pool on this error; the
        // record just needs to say so.
        if matches!(
            error,
            DeployError::Rolling(RollingError::RolledBackAfterFailure { .. })
        ) {
            self.with_deployment(id, |d| d.finish(DeploymentStatus::RolledBack));
            self.events.emit(Event::DeploymentRolledBack { id: id.clone() });
            return;
        }

        if !needs_rollback || !self.config.rollback_on_failure {
            return;
        }
        let Some(from) = from else {
            tracing::warn!(deployment = %id, "no previous version, skipping automatic rollback");
            return;
        };

        tracing::info!(deployment = %id, to = %from, "rolling back failed deployment");
        self.with_deployment(id, |d| {
            d.status = DeploymentStatus::RollingBack;
            d.log(format!("rolling back to {from}"));
        });

        match self.strategy_rollback(from).await {
            Ok(()) => {
                self.with_deployment(id, |d| d.finish(DeploymentStatus::RolledBack));
                self.events.emit(Event::DeploymentRolledBack { id: id.clone() });
            }
            Err(e) => {
                // A failed rollback is logged, never re-thrown over the
                // original failure.
                tracing::error!(deployment = %id, error = %e, "automatic rollback failed");
                self.with_deployment(id, |d| {
                    d.log(format!("rollback failed: {e}"));
                    d.finish(DeploymentStatus::Failed);
                });
            }
        }
    }

    async fn strategy_rollback(&self, to: &Version) -> Result<(), DeployError> {
        match self.config.strategy {
            Strategy::RollingUpdate | Strategy::Canary => {
                self.rolling.rollback_pool(to).await?;
                Ok(())
            }
            Strategy::BlueGreen => {
                let blue_green = self
                    .blue_green
                    .as_ref()
                    .ok_or_else(|| DeployError::Validation("blue-green not initialized".into()))?;
                blue_green.rollback().await?;
                Ok(())
            }
        }
    }

    /// Roll back a specific deployment, or the most recent eligible one.
    pub async fn rollback(&self, id: Option<DeploymentId>) -> Result<DeploymentId, DeployError> {
        {
            let active = self.active.lock();
            if let Some(current) = active.as_ref()
                && !current.status.is_terminal()
            {
                return Err(DeployError::AlreadyInProgress);
            }
        }

        let target = match id {
            Some(id) => id,
            None => self
                .latest_rollback_target()
                .ok_or(DeployError::NoRollbackTarget)?,
        };

        let Some((status, available, from)) = self.with_deployment(&target, |d| {
            (d.status, d.rollback_available, d.from_version.clone())
        }) else {
            return Err(DeployError::NotFound(target.to_string()));
        };

        if status == DeploymentStatus::RolledBack {
            return Err(DeployError::AlreadyRolledBack);
        }
        let (true, Some(from)) = (available, from) else {
            return Err(DeployError::NoRollbackTarget);
        };

        tracing::info!(deployment = %target, to = %from, "rollback requested");
        self.with_deployment(&target, |d| {
            d.status = DeploymentStatus::RollingBack;
            d.log(format!("rolling back to {from}"));
        });

        match self.strategy_rollback(&from).await {
            Ok(()) => {
                self.with_deployment(&target, |d| {
                    d.rollback_available = false;
                    d.finish(DeploymentStatus::RolledBack);
                });
                *self.current_version.lock() = Some(from);
                self.events.emit(Event::DeploymentRolledBack { id: target.clone() });
                Ok(target)
            }
            Err(e) => {
                self.with_deployment(&target, |d| {
                    d.log(format!("rollback failed: {e}"));
                    d.finish(DeploymentStatus::Failed);
                });
                Err(DeployError::RollbackFailed(e.to_string()))
            }
        }
    }

    fn latest_rollback_target(&self) -> Option<DeploymentId> {
        // Deploys archive themselves on exit, so eligible records only
        // ever live in the history ring.
        self.history
            .lock()
            .latest_rollback_target()
            .map(|d| d.id.clone())
    }

    /// The deployment currently in flight, if any.
    pub fn current(&self) -> Option<Deployment> {
        self.active.lock().clone()
    }

    /// The in-flight deployment, or the most recently archived one.
    pub fn latest(&self) -> Option<Deployment> {
        if let Some(d) = self.active.lock().clone() {
            return Some(d);
        }
        self.history.lock().iter().last().cloned()
    }

    pub fn find(&self, id: &DeploymentId) -> Option<Deployment> {
        self.with_deployment(id, |d| d.clone())
    }

    /// Archived deployments, oldest first, excluding the live record.
    pub fn history_snapshot(&self) -> Vec<Deployment> {
        self.history.lock().iter().cloned().collect()
    }

    fn begin_step(&self, id: &DeploymentId, step: &str) {
        tracing::info!(deployment = %id, step, "pipeline step");
        self.with_deployment(id, |d| d.begin_step(step));
    }

    fn complete_step(&self, id: &DeploymentId, step: &str) {
        let progress = self.with_deployment(id, |d| {
            d.complete_step();
            (d.completed_steps, d.total_steps)
        });
        if let Some((completed, total)) = progress {
            self.events.emit(Event::DeploymentStepCompleted {
                id: id.clone(),
                step: step.to_string(),
                completed,
                total,
            });
        }
    }

    fn with_deployment<R>(
        &self,
        id: &DeploymentId,
        f: impl FnOnce(&mut Deployment) -> R,
    ) -> Option<R> {
        {
            let mut active = self.active.lock();
            if let Some(d) = active.as_mut()
                && &d.id == id
            {
                return Some(f(d));
            }
        }
        self.history.lock().find_mut(id).map(f)
    }
}

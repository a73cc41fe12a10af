// ABOUTME: Rolling update manager - replaces a fixed instance pool batch by batch.
// ABOUTME: Members of a batch update concurrently; batches run strictly in sequence.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::RollingConfig;
use crate::events::{Event, EventBus};
use crate::health::HealthProbe;
use crate::deploy::{Instance, InstanceStatus};
use crate::runtime::InstanceRuntime;
use crate::types::Version;

#[derive(Debug, thiserror::Error)]
pub enum RollingError {
    #[error("instance pool is empty")]
    EmptyPool,

    #[error("no artifact staged for version {0}")]
    UnknownVersion(Version),

    #[error("batch update failed: {failures}")]
    BatchFailed { failures: String },

    #[error("update failed and pool was rolled back to {version}: {failures}")]
    RolledBackAfterFailure { version: Version, failures: String },
}

/// Outcome of a batch run: which pool indices were successfully updated
/// before (and including) the failing batch.
struct BatchFailure {
    updated: Vec<usize>,
    failures: Vec<(String, String)>,
}

impl BatchFailure {
    fn describe(&self) -> String {
        self.failures
            .iter()
            .map(|(id, msg)| format!("{id}: {msg}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Drives in-place replacement of a fixed instance pool.
pub struct RollingUpdateManager {
    runtime: Arc<dyn InstanceRuntime>,
    probe: HealthProbe,
    config: RollingConfig,
    health_retries: u32,
    rollback_on_failure: bool,
    events: EventBus,
    pool: Mutex<Vec<Instance>>,
    /// Artifact staged per version, so a rollback pass can re-stage the
    /// previous artifact.
    artifacts: Mutex<HashMap<Version, PathBuf>>,
}

impl RollingUpdateManager {
    pub fn new(
        runtime: Arc<dyn InstanceRuntime>,
        probe: HealthProbe,
        config: RollingConfig,
        health_retries: u32,
        rollback_on_failure: bool,
        events: EventBus,
    ) -> Self {
        Self {
            runtime,
            probe,
            config,
            health_retries,
            rollback_on_failure,
            events,
            pool: Mutex::new(vec![]),
            artifacts: Mutex::new(HashMap::new()),
        }
    }

    /// Populate the pool. Existing pool state is replaced.
    pub fn initialize_pool(&self, ports: &[u16], version: &Version) {
        let mut pool = self.pool.lock();
        *pool = ports
            .iter()
            .map(|&port| Instance::new(port, version.clone()))
            .collect();
    }

    /// Start every pool instance and wait for it to become healthy.
    pub async fn start_pool(&self, artifact: Option<&PathBuf>, version: &Version) -> Result<(), RollingError> {
        let indices: Vec<usize> = (0..self.pool.lock().len()).collect();
        if indices.is_empty() {
            return Err(RollingError::EmptyPool);
        }
        if let Some(artifact) = artifact {
            self.artifacts
                .lock()
                .insert(version.clone(), artifact.clone());
        }
        match self.run_batches(&indices, version, true).await {
            Ok(_) => Ok(()),
            Err(failure) => Err(RollingError::BatchFailed {
                failures: failure.describe(),
            }),
        }
    }

    pub fn pool_snapshot(&self) -> Vec<Instance> {
        self.pool.lock().clone()
    }

    /// Replace the pool with instances rehydrated from persisted state.
    pub fn restore_pool(&self, instances: Vec<Instance>) {
        *self.pool.lock() = instances;
    }

    /// Every known version-to-artifact mapping, for persistence.
    pub fn artifact_snapshot(&self) -> Vec<(Version, PathBuf)> {
        self.artifacts
            .lock()
            .iter()
            .map(|(v, p)| (v.clone(), p.clone()))
            .collect()
    }

    /// Record where the artifact for `version` lives, for later staging
    /// and rollback passes.
    pub fn register_artifact(&self, version: &Version, artifact: &Path) {
        self.artifacts
            .lock()
            .insert(version.clone(), artifact.to_path_buf());
    }

    /// Effective batch size: the configured batch size, bounded by the
    /// resolved `max_unavailable`.
    pub fn batch_size(&self) -> usize {
        let pool_size = self.pool.lock().len();
        let max_unavailable = self.config.max_unavailable.resolve(pool_size).max(1);
        self.config.update_batch_size.min(max_unavailable).max(1)
    }

    /// Replace the whole pool with `version`, batch by batch.
    ///
    /// On a member failure with rollback-on-failure enabled, every
    /// already-updated instance is rolled back to `previous` with the
    /// same batching algorithm before the error is reported.
    pub async fn update_pool(
        &self,
        artifact: &PathBuf,
        previous: Option<&Version>,
        version: &Version,
    ) -> Result<(), RollingError> {
        let indices: Vec<usize> = (0..self.pool.lock().len()).collect();
        if indices.is_empty() {
            return Err(RollingError::EmptyPool);
        }
        self.artifacts
            .lock()
            .insert(version.clone(), artifact.clone());
        self.update_indices(&indices, previous, version).await
    }

    /// Replace a subset of the pool (used by the canary strategy for the
    /// canary set and the later full promotion).
    pub async fn update_indices(
        &self,
        indices: &[usize],
        previous: Option<&Version>,
        version: &Version,
    ) -> Result<(), RollingError> {
        match self.run_batches(indices, version, false).await {
            Ok(_) => Ok(()),
            Err(failure) => {
                let failures = failure.describe();
                if self.rollback_on_failure
                    && let Some(previous) = previous
                    && !failure.updated.is_empty()
                {
                    tracing::warn!(
                        count = failure.updated.len(),
                        to = %previous,
                        "rolling updated instances back after batch failure"
                    );
                    if let Err(rollback_failure) =
                        self.run_batches(&failure.updated, previous, false).await
                    {
                        tracing::error!(
                            failures = %rollback_failure.describe(),
                            "rollback pass left instances unhealthy"
                        );
                    }
                    return Err(RollingError::RolledBackAfterFailure {
                        version: previous.clone(),
                        failures,
                    });
                }
                Err(RollingError::BatchFailed { failures })
            }
        }
    }

    /// Roll the whole pool to `version` (rollback path for the pipeline).
    pub async fn rollback_pool(&self, version: &Version) -> Result<(), RollingError> {
        let indices: Vec<usize> = (0..self.pool.lock().len()).collect();
        if indices.is_empty() {
            return Err(RollingError::EmptyPool);
        }
        if !self.artifacts.lock().contains_key(version) {
            return Err(RollingError::UnknownVersion(version.clone()));
        }
        match self.run_batches(&indices, version, false).await {
            Ok(_) => Ok(()),
            Err(failure) => Err(RollingError::BatchFailed {
                failures: failure.describe(),
            }),
        }
    }

    /// Partition `indices` into contiguous batches and process them in
    /// order. Batch members update concurrently; a member failure does
    /// not abort its siblings, the batch result is evaluated once all
    /// members settle.
    async fn run_batches(
        &self,
        indices: &[usize],
        version: &Version,
        initial_start: bool,
    ) -> Result<Vec<usize>, BatchFailure> {
        let batch_size = self.batch_size();
        let total_batches = indices.len().div_ceil(batch_size);
        let mut updated: Vec<usize> = vec![];

        for (batch_number, batch) in indices.chunks(batch_size).enumerate() {
            tracing::info!(
                batch = batch_number + 1,
                total_batches,
                size = batch.len(),
                %version,
                "processing batch"
            );

            let members = batch
                .iter()
                .map(|&index| self.update_member(index, version, initial_start));
            let outcomes = futures::future::join_all(members).await;

            let mut failures = vec![];
            for (index, outcome) in batch.iter().zip(outcomes) {
                match outcome {
                    Ok(()) => updated.push(*index),
                    Err(message) => {
                        let id = self
                            .with_instance(*index, |i| i.id.to_string())
                            .unwrap_or_else(|| format!("#{index}"));
                        failures.push((id, message));
                    }
                }
            }

            if !failures.is_empty() {
                return Err(BatchFailure { updated, failures });
            }

            let is_last = batch_number + 1 == total_batches;
            if !is_last && !self.config.update_delay.is_zero() {
                tokio::time::sleep(self.config.update_delay).await;
            }
        }

        Ok(updated)
    }

    /// Update one pool member in place: stop, stage the new artifact,
    /// start, wait for health. The instance keeps its id and port.
    async fn update_member(
        &self,
        index: usize,
        version: &Version,
        initial_start: bool,
    ) -> Result<(), String> {
        let Some((id, port, addr)) = self.with_instance(index, |i| {
            (i.id.clone(), i.port, i.addr())
        }) else {
            return Err(format!("no pool instance at index {index}"));
        };

        if !initial_start {
            self.set_status(index, InstanceStatus::Updating);
            self.set_status(index, InstanceStatus::Terminating);
            if let Err(e) = self
                .runtime
                .stop_instance(port, self.config.graceful_shutdown_timeout)
                .await
            {
                // A dead instance is fine to replace; anything else is not.
                if !matches!(e, crate::runtime::RuntimeError::NotRunning(_)) {
                    self.set_status(index, InstanceStatus::Unhealthy);
                    return Err(format!("stop failed: {e}"));
                }
            }
            self.set_status(index, InstanceStatus::Terminated);
            self.events.emit(Event::InstanceStopped { id: id.clone() });
        }

        // Copy the path out first: batch members run concurrently, and the
        // registry lock must not be held across the staging await.
        let staged = self.artifacts.lock().get(version).cloned();
        if let Some(artifact) = staged
            && let Err(e) = self.runtime.stage_artifact(&artifact, version, port).await
        {
            self.set_status(index, InstanceStatus::Unhealthy);
            return Err(format!("artifact staging failed: {e}"));
        }

        self.set_status(index, InstanceStatus::Starting);
        {
            let mut pool = self.pool.lock();
            if let Some(instance) = pool.get_mut(index) {
                instance.version = version.clone();
                instance.reset_health();
            }
        }

        if let Err(e) = self.runtime.start_instance(port, version).await {
            self.set_status(index, InstanceStatus::Unhealthy);
            return Err(format!("start failed: {e}"));
        }
        self.events.emit(Event::InstanceUpdated {
            id: id.clone(),
            version: version.clone(),
        });

        match self.probe.wait_healthy(&addr, self.health_retries).await {
            Ok(()) => {
                {
                    let mut pool = self.pool.lock();
                    if let Some(instance) = pool.get_mut(index) {
                        instance.record_health(true);
                        instance.set_status(InstanceStatus::Healthy);
                    }
                }
                self.events.emit(Event::InstanceHealthy { id });
                Ok(())
            }
            Err(e) => {
                {
                    let mut pool = self.pool.lock();
                    if let Some(instance) = pool.get_mut(index) {
                        instance.record_health(false);
                        instance.set_status(InstanceStatus::Unhealthy);
                    }
                }
                self.events.emit(Event::InstanceUnhealthy { id });
                Err(e.to_string())
            }
        }
    }

    /// Stop every pool instance (shutdown path).
    pub async fn stop_pool(&self) {
        let entries: Vec<(usize, u16)> = {
            let pool = self.pool.lock();
            pool.iter().enumerate().map(|(i, inst)| (i, inst.port)).collect()
        };
        for (index, port) in entries {
            self.set_status(index, InstanceStatus::Terminating);
            if let Err(e) = self
                .runtime
                .stop_instance(port, self.config.graceful_shutdown_timeout)
                .await
            {
                tracing::debug!(port, error = %e, "pool stop");
            }
            self.set_status(index, InstanceStatus::Terminated);
            if let Some(id) = self.with_instance(index, |i| i.id.clone()) {
                self.events.emit(Event::InstanceStopped { id });
            }
        }
    }

    fn with_instance<R>(&self, index: usize, f: impl FnOnce(&Instance) -> R) -> Option<R> {
        self.pool.lock().get(index).map(f)
    }

    fn set_status(&self, index: usize, status: InstanceStatus) {
        let mut pool = self.pool.lock();
        if let Some(instance) = pool.get_mut(index) {
            instance.set_status(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolFraction;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;

    /// Runtime fake that records operations and never spawns anything.
    #[derive(Default)]
    struct FakeRuntime {
        running: Mutex<Vec<u16>>,
        ops: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InstanceRuntime for FakeRuntime {
        async fn stage_artifact(
            &self,
            _artifact: &Path,
            version: &Version,
            port: u16,
        ) -> Result<(), crate::runtime::RuntimeError> {
            // Real staging suspends on filesystem I/O.
            tokio::task::yield_now().await;
            self.ops.lock().push(format!("stage {port} {version}"));
            Ok(())
        }

        async fn start_instance(
            &self,
            port: u16,
            version: &Version,
        ) -> Result<(), crate::runtime::RuntimeError> {
            self.ops.lock().push(format!("start {port} {version}"));
            self.running.lock().push(port);
            Ok(())
        }

        async fn stop_instance(
            &self,
            port: u16,
            _graceful_timeout: Duration,
        ) -> Result<(), crate::runtime::RuntimeError> {
            self.ops.lock().push(format!("stop {port}"));
            self.running.lock().retain(|&p| p != port);
            Ok(())
        }

        async fn is_running(&self, port: u16) -> bool {
            self.running.lock().contains(&port)
        }
    }

    fn config(batch_size: usize, max_unavailable: PoolFraction) -> RollingConfig {
        RollingConfig {
            max_unavailable,
            max_surge: PoolFraction::Count(0),
            update_batch_size: batch_size,
            update_delay: Duration::ZERO,
            graceful_shutdown_timeout: Duration::from_millis(100),
        }
    }

    fn version(s: &str) -> Version {
        Version::new(s).unwrap()
    }

    #[test]
    fn batch_size_is_bounded_by_max_unavailable() {
        let manager = RollingUpdateManager::new(
            Arc::new(FakeRuntime::default()),
            HealthProbe::new("/health", Duration::from_millis(100)),
            config(3, PoolFraction::Count(1)),
            1,
            false,
            EventBus::new(),
        );
        manager.initialize_pool(&[9001, 9002, 9003, 9004], &version("1.0.0"));
        assert_eq!(manager.batch_size(), 1);
    }

    #[test]
    fn percentage_max_unavailable_rounds_up() {
        let manager = RollingUpdateManager::new(
            Arc::new(FakeRuntime::default()),
            HealthProbe::new("/health", Duration::from_millis(100)),
            config(8, PoolFraction::Percent(50)),
            1,
            false,
            EventBus::new(),
        );
        manager.initialize_pool(&[1, 2, 3, 4, 5].map(|p| 9000 + p), &version("1.0.0"));
        // 50% of 5 instances rounds up to 3; batch size 8 is clamped.
        assert_eq!(manager.batch_size(), 3);
    }

    #[test]
    fn pool_initialization_creates_pending_instances() {
        let manager = RollingUpdateManager::new(
            Arc::new(FakeRuntime::default()),
            HealthProbe::new("/health", Duration::from_millis(100)),
            config(1, PoolFraction::Count(1)),
            1,
            false,
            EventBus::new(),
        );
        manager.initialize_pool(&[9001, 9002], &version("1.0.0"));
        let pool = manager.pool_snapshot();
        assert_eq!(pool.len(), 2);
        assert!(pool.iter().all(|i| i.status == InstanceStatus::Pending));
        assert_eq!(pool[0].id.as_str(), "instance-9001");
    }

    #[tokio::test]
    async fn update_fails_when_instances_never_become_healthy() {
        // Probe points at a port nothing listens on, so health never passes.
        let manager = RollingUpdateManager::new(
            Arc::new(FakeRuntime::default()),
            HealthProbe::new("/health", Duration::from_millis(50)),
            config(1, PoolFraction::Count(1)),
            1,
            false,
            EventBus::new(),
        );
        manager.initialize_pool(&[1], &version("1.0.0"));

        let err = manager
            .update_pool(
                &PathBuf::from("/tmp/app"),
                Some(&version("1.0.0")),
                &version("2.0.0"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RollingError::BatchFailed { .. }));
        assert!(err.to_string().contains("failed health checks"));
    }

    #[tokio::test]
    async fn empty_pool_is_rejected() {
        let manager = RollingUpdateManager::new(
            Arc::new(FakeRuntime::default()),
            HealthProbe::new("/health", Duration::from_millis(50)),
            config(1, PoolFraction::Count(1)),
            1,
            false,
            EventBus::new(),
        );
        let err = manager
            .update_pool(&PathBuf::from("/tmp/app"), None, &version("2.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, RollingError::EmptyPool));
    }

    #[tokio::test]
    async fn rollback_requires_a_known_artifact() {
        let manager = RollingUpdateManager::new(
            Arc::new(FakeRuntime::default()),
            HealthProbe::new("/health", Duration::from_millis(50)),
            config(1, PoolFraction::Count(1)),
            1,
            true,
            EventBus::new(),
        );
        manager.initialize_pool(&[9001], &version("1.0.0"));
        let err = manager.rollback_pool(&version("0.9.0")).await.unwrap_err();
        assert!(matches!(err, RollingError::UnknownVersion(_)));
    }
}

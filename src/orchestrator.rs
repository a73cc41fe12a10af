// ABOUTME: Top-level facade wiring config, runtime, strategies, and shutdown
// ABOUTME: into one object the CLI drives.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bluegreen::{BlueGreenDeployment, BlueGreenStatus};
use crate::config::{Config, HookConfig, Strategy};
use crate::deploy::{Deployment, DeployError, DeploymentManager, Instance};
use crate::error::Result;
use crate::events::{EventBus, LogSink};
use crate::health::HealthProbe;
use crate::rolling::RollingUpdateManager;
use crate::runtime::{InstanceRuntime, ProcessRuntime};
use crate::shutdown::{
    GracefulShutdownManager, HookAction, ShutdownHook, ShutdownOutcome, ShutdownStatus,
};
use crate::state::{PersistedBlueGreen, PersistedState};
use crate::types::{DeploymentId, Version};

/// Where staged per-instance artifacts live, relative to the working
/// directory.
const ARTIFACT_DIR: &str = ".cutover/artifacts";

/// Combined status answer for the CLI and any other frontend.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub service: String,
    pub strategy: Strategy,
    pub current_version: Option<Version>,
    pub deployment: Option<Deployment>,
    pub instances: Vec<Instance>,
    pub blue_green: Option<BlueGreenStatus>,
    pub shutdown: ShutdownStatus,
}

pub struct DeploymentOrchestrator {
    config: Config,
    events: EventBus,
    rolling: Arc<RollingUpdateManager>,
    blue_green: Option<Arc<BlueGreenDeployment>>,
    deployments: Arc<DeploymentManager>,
    shutdown: Arc<GracefulShutdownManager>,
}

impl DeploymentOrchestrator {
    pub fn new(config: Config) -> Self {
        let events = EventBus::new();
        events.register(Arc::new(LogSink));

        let runtime: Arc<dyn InstanceRuntime> = Arc::new(ProcessRuntime::new(
            config.command.clone(),
            PathBuf::from(ARTIFACT_DIR),
        ));
        let probe = HealthProbe::new(config.health.path.clone(), config.health.timeout);

        let rolling = Arc::new(RollingUpdateManager::new(
            Arc::clone(&runtime),
            probe.clone(),
            config.rolling.clone(),
            config.health.retries,
            config.rollback_on_failure,
            events.clone(),
        ));

        let shutdown = Arc::new(GracefulShutdownManager::new(
            config.shutdown.clone(),
            events.clone(),
        ));

        let blue_green = (config.strategy == Strategy::BlueGreen).then(|| {
            Arc::new(BlueGreenDeployment::new(
                config.blue_green.clone(),
                Arc::clone(&runtime),
                probe.clone(),
                config.health.retries,
                events.clone(),
                Some(Arc::clone(&shutdown)),
            ))
        });

        let deployments = Arc::new(DeploymentManager::new(
            config.clone(),
            events.clone(),
            Arc::clone(&rolling),
            blue_green.clone(),
        ));

        Self {
            config,
            events,
            rolling,
            blue_green,
            deployments,
            shutdown,
        }
    }

    /// Bring up the strategy-specific machinery and wire the built-in
    /// shutdown hook that stops whatever is running.
    pub async fn initialize(&self) -> Result<()> {
        if let Some(blue_green) = &self.blue_green {
            blue_green.initialize().await.map_err(DeployError::from)?;

            // The proxy stops accepting at the start of DRAINING;
            // environments are stopped later by the stop-instances hook.
            let bg = Arc::clone(blue_green);
            self.shutdown
                .register_listener(Box::new(move || bg.stop_accepting()));
        }

        self.register_stop_hook();
        for hook in &self.config.shutdown.hooks {
            match hook.command.clone() {
                Some(command) => self.register_command_hook(hook, command),
                None => {
                    tracing::debug!(hook = %hook.name, "configured hook awaits a registered action");
                }
            }
        }
        Ok(())
    }

    /// Config-declared hooks with a `command` run it through the shell;
    /// a non-zero exit fails the hook.
    fn register_command_hook(&self, config: &HookConfig, command: String) {
        let action: HookAction = Box::new(move || {
            let command = command.clone();
            Box::pin(async move {
                let output = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(&command)
                    .output()
                    .await
                    .map_err(|e| format!("failed to run: {e}"))?;
                if output.status.success() {
                    Ok(())
                } else {
                    Err(format!(
                        "exit code {:?}: {}",
                        output.status.code(),
                        String::from_utf8_lossy(&output.stderr).trim()
                    ))
                }
            })
        });
        self.shutdown
            .register_hook(ShutdownHook::from_config(config, action));
    }

    fn register_stop_hook(&self) {
        let action: HookAction = match &self.blue_green {
            Some(blue_green) => {
                let blue_green = Arc::clone(blue_green);
                Box::new(move || {
                    let blue_green = Arc::clone(&blue_green);
                    Box::pin(async move {
                        blue_green.shutdown().await;
                        Ok(())
                    })
                })
            }
            None => {
                let rolling = Arc::clone(&self.rolling);
                Box::new(move || {
                    let rolling = Arc::clone(&rolling);
                    Box::pin(async move {
                        rolling.stop_pool().await;
                        Ok(())
                    })
                })
            }
        };
        self.shutdown.register_hook(
            ShutdownHook::new("stop-instances", action)
                .priority(100)
                .timeout(self.config.shutdown.graceful_timeout),
        );
    }

    /// Attach an executable action to a hook declared in the
    /// configuration. Unknown names get default priority and timeout.
    pub fn register_hook_action(&self, name: &str, action: HookAction) {
        let hook = match self.config.shutdown.hooks.iter().find(|h| h.name == name) {
            Some(config) => ShutdownHook::from_config(config, action),
            None => ShutdownHook::new(name, action),
        };
        self.shutdown.register_hook(hook);
    }

    pub async fn deploy(&self, artifact: &Path, version: Version) -> Result<DeploymentId> {
        Ok(self.deployments.deploy(artifact, version).await?)
    }

    pub async fn rollback(&self, id: Option<DeploymentId>) -> Result<DeploymentId> {
        Ok(self.deployments.rollback(id).await?)
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            service: self.config.service.clone(),
            strategy: self.config.strategy,
            current_version: self.deployments.current_version(),
            deployment: self.deployments.latest(),
            instances: self.rolling.pool_snapshot(),
            blue_green: self.blue_green.as_ref().map(|bg| bg.status()),
            shutdown: self.shutdown.status(),
        }
    }

    pub fn history(&self) -> Vec<Deployment> {
        self.deployments.history_snapshot()
    }

    /// Write the state blob later `rollback` and `status` invocations
    /// read.
    pub fn persist_state(&self, dir: &Path) -> Result<()> {
        let blue_green = self.blue_green.as_ref().map(|bg| {
            let status = bg.status();
            PersistedBlueGreen {
                active: status.active,
                blue_version: status.blue.version,
                green_version: status.green.version,
            }
        });
        PersistedState {
            current_version: self.deployments.current_version(),
            history: self.deployments.history_snapshot(),
            artifacts: self.rolling.artifact_snapshot(),
            instances: self.rolling.pool_snapshot(),
            blue_green,
        }
        .save(dir)
    }

    /// Load state written by a previous run. Returns false when no state
    /// file exists yet.
    pub fn restore_state(&self, dir: &Path) -> Result<bool> {
        let Some(state) = PersistedState::load(dir)? else {
            return Ok(false);
        };
        self.deployments.restore(state.history, state.current_version);
        self.rolling.restore_pool(state.instances);
        for (version, artifact) in &state.artifacts {
            self.rolling.register_artifact(version, artifact);
        }
        if let (Some(bg), Some(saved)) = (&self.blue_green, state.blue_green) {
            bg.restore(saved.active, saved.blue_version, saved.green_version);
        }
        Ok(true)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn shutdown_manager(&self) -> Arc<GracefulShutdownManager> {
        Arc::clone(&self.shutdown)
    }

    pub async fn shutdown(&self, reason: &str) -> ShutdownOutcome {
        self.shutdown.initiate_shutdown(reason).await
    }
}

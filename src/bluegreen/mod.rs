// ABOUTME: Blue-green deployment - two whole environments behind an embedded reverse proxy.
// ABOUTME: Deploys into the inactive environment, switches traffic, then stops the old one.

mod proxy;

pub use proxy::{ProxyTarget, ReverseProxy};

use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::BlueGreenConfig;
use crate::events::{Event, EventBus};
use crate::health::{HealthProbe, ProbeError, ProbeOutcome};
use crate::runtime::{InstanceRuntime, RuntimeError};
use crate::shutdown::GracefulShutdownManager;
use crate::types::Version;

/// How often each environment is probed, independent of deployments.
pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum BlueGreenError {
    #[error("a blue-green deployment is already in progress")]
    DeploymentInProgress,

    #[error("failed to bind reverse proxy: {0}")]
    ProxyBind(#[from] std::io::Error),

    #[error("environment {name} failed health checks: {source}")]
    EnvironmentUnhealthy {
        name: EnvName,
        source: ProbeError,
    },

    #[error("no previous environment to roll back to")]
    NothingToRollBack,

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvName {
    Blue,
    Green,
}

impl EnvName {
    pub fn other(self) -> Self {
        match self {
            EnvName::Blue => EnvName::Green,
            EnvName::Green => EnvName::Blue,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EnvName::Blue => "blue",
            EnvName::Green => "green",
        }
    }
}

impl std::fmt::Display for EnvName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvStatus {
    Stopped,
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
}

/// One whole environment. Exactly two exist for the lifetime of the
/// system; they cycle through states but are never created or destroyed.
#[derive(Debug, Clone, Serialize)]
pub struct Environment {
    pub name: EnvName,
    pub port: u16,
    pub status: EnvStatus,
    pub version: Option<Version>,
    pub checks_passed: u32,
    pub checks_failed: u32,
}

impl Environment {
    fn new(name: EnvName, port: u16) -> Self {
        Self {
            name,
            port,
            status: EnvStatus::Stopped,
            version: None,
            checks_passed: 0,
            checks_failed: 0,
        }
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

#[derive(Debug)]
struct State {
    blue: Environment,
    green: Environment,
    active: Option<EnvName>,
    deploying: bool,
}

impl State {
    fn env(&self, name: EnvName) -> &Environment {
        match name {
            EnvName::Blue => &self.blue,
            EnvName::Green => &self.green,
        }
    }

    fn env_mut(&mut self, name: EnvName) -> &mut Environment {
        match name {
            EnvName::Blue => &mut self.blue,
            EnvName::Green => &mut self.green,
        }
    }
}

/// Snapshot for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct BlueGreenStatus {
    pub blue: Environment,
    pub green: Environment,
    pub active: Option<EnvName>,
    pub deploying: bool,
}

pub struct BlueGreenDeployment {
    config: BlueGreenConfig,
    runtime: Arc<dyn InstanceRuntime>,
    probe: HealthProbe,
    health_retries: u32,
    events: EventBus,
    state: Arc<Mutex<State>>,
    target: ProxyTarget,
    proxy: Mutex<Option<ReverseProxy>>,
    poll_stop: watch::Sender<bool>,
    /// When present, proxy connections register with the drain machinery.
    shutdown: Option<Arc<GracefulShutdownManager>>,
}

impl BlueGreenDeployment {
    pub fn new(
        config: BlueGreenConfig,
        runtime: Arc<dyn InstanceRuntime>,
        probe: HealthProbe,
        health_retries: u32,
        events: EventBus,
        shutdown: Option<Arc<GracefulShutdownManager>>,
    ) -> Self {
        let state = State {
            blue: Environment::new(EnvName::Blue, config.blue_port),
            green: Environment::new(EnvName::Green, config.green_port),
            active: None,
            deploying: false,
        };
        let (poll_stop, _) = watch::channel(false);
        Self {
            config,
            runtime,
            probe,
            health_retries,
            events,
            state: Arc::new(Mutex::new(state)),
            target: ProxyTarget::new(),
            proxy: Mutex::new(None),
            poll_stop,
            shutdown,
        }
    }

    /// Rehydrate environment versions and the active pointer from
    /// persisted state. Instances are not restarted; the next deploy or
    /// rollback brings whichever environment it needs back up.
    pub fn restore(
        &self,
        active: Option<EnvName>,
        blue_version: Option<Version>,
        green_version: Option<Version>,
    ) {
        let mut state = self.state.lock();
        state.blue.version = blue_version;
        state.green.version = green_version;
        state.active = active;
    }

    /// Bind the proxy and start the per-environment health pollers.
    /// Called once before the first deploy.
    pub async fn initialize(&self) -> Result<(), BlueGreenError> {
        let proxy = ReverseProxy::bind(
            self.config.proxy_port,
            self.target.clone(),
            self.shutdown.clone(),
        )
        .await?;
        *self.proxy.lock() = Some(proxy);

        for name in [EnvName::Blue, EnvName::Green] {
            self.spawn_poller(name);
        }
        Ok(())
    }

    /// Independent periodic health probe for one environment. A STARTING
    /// environment promotes to HEALTHY on its first pass; a HEALTHY one
    /// demotes to UNHEALTHY on its first failure.
    fn spawn_poller(&self, name: EnvName) {
        let state = Arc::clone(&self.state);
        let probe = self.probe.clone();
        let events = self.events.clone();
        let mut stop = self.poll_stop.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HEALTH_POLL_INTERVAL) => {}
                    _ = stop.changed() => break,
                }

                let addr = {
                    let state = state.lock();
                    let env = state.env(name);
                    match env.status {
                        EnvStatus::Starting | EnvStatus::Healthy | EnvStatus::Unhealthy => {
                            env.addr()
                        }
                        EnvStatus::Stopped | EnvStatus::Stopping => continue,
                    }
                };

                let passed = probe.check(&addr).await == ProbeOutcome::Healthy;

                let transition = {
                    let mut state = state.lock();
                    let env = state.env_mut(name);
                    if passed {
                        env.checks_passed += 1;
                    } else {
                        env.checks_failed += 1;
                    }
                    match (env.status, passed) {
                        (EnvStatus::Starting | EnvStatus::Unhealthy, true) => {
                            env.status = EnvStatus::Healthy;
                            Some(true)
                        }
                        (EnvStatus::Healthy, false) => {
                            env.status = EnvStatus::Unhealthy;
                            Some(false)
                        }
                        _ => None,
                    }
                };

                match transition {
                    Some(true) => events.emit(Event::EnvironmentHealthy {
                        name: name.to_string(),
                    }),
                    Some(false) => events.emit(Event::EnvironmentUnhealthy {
                        name: name.to_string(),
                    }),
                    None => {}
                }
            }
        });
    }

    /// Deploy `version` into the inactive environment and switch traffic.
    pub async fn deploy(&self, artifact: &Path, version: &Version) -> Result<(), BlueGreenError> {
        let (target_name, source_name, target_port) = {
            let mut state = self.state.lock();
            if state.deploying {
                return Err(BlueGreenError::DeploymentInProgress);
            }
            state.deploying = true;

            let target_name = state.active.map(EnvName::other).unwrap_or(EnvName::Blue);
            let source_name = state.active;
            let target = state.env_mut(target_name);
            target.status = EnvStatus::Starting;
            target.version = Some(version.clone());
            target.checks_passed = 0;
            target.checks_failed = 0;
            (target_name, source_name, target.port)
        };

        let result = self
            .bring_up_and_switch(artifact, version, target_name, source_name, target_port)
            .await;

        self.state.lock().deploying = false;
        result
    }

    async fn bring_up_and_switch(
        &self,
        artifact: &Path,
        version: &Version,
        target_name: EnvName,
        source_name: Option<EnvName>,
        target_port: u16,
    ) -> Result<(), BlueGreenError> {
        tracing::info!(env = %target_name, %version, "deploying to inactive environment");

        self.runtime
            .stage_artifact(artifact, version, target_port)
            .await?;
        self.runtime.start_instance(target_port, version).await?;

        let addr = format!("127.0.0.1:{target_port}");
        if let Err(source) = self.probe.wait_healthy(&addr, self.health_retries).await {
            {
                let mut state = self.state.lock();
                state.env_mut(target_name).status = EnvStatus::Unhealthy;
            }
            self.events.emit(Event::EnvironmentUnhealthy {
                name: target_name.to_string(),
            });
            // Best effort teardown of the failed environment.
            let _ = self
                .runtime
                .stop_instance(target_port, self.config.stop_timeout)
                .await;
            self.state.lock().env_mut(target_name).status = EnvStatus::Stopped;
            return Err(BlueGreenError::EnvironmentUnhealthy {
                name: target_name,
                source,
            });
        }

        self.state.lock().env_mut(target_name).status = EnvStatus::Healthy;
        self.events.emit(Event::EnvironmentHealthy {
            name: target_name.to_string(),
        });

        self.switch_and_stop(target_name, source_name).await;
        Ok(())
    }

    /// Settle, point the proxy at the new environment, then stop the old
    /// one. The switch itself is a single atomic store.
    async fn switch_and_stop(&self, target_name: EnvName, source_name: Option<EnvName>) {
        if !self.config.traffic_switch_delay.is_zero() {
            tokio::time::sleep(self.config.traffic_switch_delay).await;
        }

        let target_port = self.state.lock().env(target_name).port;
        self.target.switch(Some(target_port));
        self.events.emit(Event::TrafficSwitched {
            from: source_name.map(|n| n.to_string()),
            to: target_name.to_string(),
        });
        tracing::info!(to = %target_name, "traffic switched");

        if let Some(source_name) = source_name {
            let source_port = {
                let mut state = self.state.lock();
                let source = state.env_mut(source_name);
                source.status = EnvStatus::Stopping;
                source.port
            };
            match self
                .runtime
                .stop_instance(source_port, self.config.stop_timeout)
                .await
            {
                Ok(()) | Err(RuntimeError::NotRunning(_)) => {}
                Err(e) => tracing::warn!(env = %source_name, error = %e, "old environment stop failed"),
            }
            self.state.lock().env_mut(source_name).status = EnvStatus::Stopped;
            self.events.emit(Event::EnvironmentStopped {
                name: source_name.to_string(),
            });
        }

        self.state.lock().active = Some(target_name);
    }

    /// Switch back to the previously active environment. Rejected while
    /// a deployment is in progress.
    pub async fn rollback(&self) -> Result<(), BlueGreenError> {
        let (previous_name, current_name, previous_port, previous_version) = {
            let mut state = self.state.lock();
            if state.deploying {
                return Err(BlueGreenError::DeploymentInProgress);
            }
            let Some(current) = state.active else {
                return Err(BlueGreenError::NothingToRollBack);
            };
            let previous_name = current.other();
            let previous = state.env(previous_name);
            let Some(previous_version) = previous.version.clone() else {
                return Err(BlueGreenError::NothingToRollBack);
            };
            let port = previous.port;
            state.deploying = true;
            let env = state.env_mut(previous_name);
            env.status = EnvStatus::Starting;
            env.checks_passed = 0;
            env.checks_failed = 0;
            (previous_name, current, port, previous_version)
        };

        tracing::info!(to = %previous_name, version = %previous_version, "rolling back blue-green");

        let result = async {
            self.runtime
                .start_instance(previous_port, &previous_version)
                .await?;

            let addr = format!("127.0.0.1:{previous_port}");
            if let Err(source) = self.probe.wait_healthy(&addr, self.health_retries).await {
                self.state.lock().env_mut(previous_name).status = EnvStatus::Unhealthy;
                let _ = self
                    .runtime
                    .stop_instance(previous_port, self.config.stop_timeout)
                    .await;
                self.state.lock().env_mut(previous_name).status = EnvStatus::Stopped;
                return Err(BlueGreenError::EnvironmentUnhealthy {
                    name: previous_name,
                    source,
                });
            }

            self.state.lock().env_mut(previous_name).status = EnvStatus::Healthy;
            self.switch_and_stop(previous_name, Some(current_name)).await;
            Ok(())
        }
        .await;

        self.state.lock().deploying = false;
        result
    }

    pub fn active_environment(&self) -> Option<EnvName> {
        self.state.lock().active
    }

    pub fn status(&self) -> BlueGreenStatus {
        let state = self.state.lock();
        BlueGreenStatus {
            blue: state.blue.clone(),
            green: state.green.clone(),
            active: state.active,
            deploying: state.deploying,
        }
    }

    pub fn proxy_addr(&self) -> Option<std::net::SocketAddr> {
        self.proxy.lock().as_ref().map(|p| p.local_addr())
    }

    /// Close the proxy listener so no new requests are accepted. Running
    /// environments keep serving whatever is already in flight.
    pub fn stop_accepting(&self) {
        if let Some(proxy) = self.proxy.lock().take() {
            proxy.stop();
        }
    }

    /// Stop pollers, proxy, and any running environment.
    pub async fn shutdown(&self) {
        let _ = self.poll_stop.send(true);
        if let Some(proxy) = self.proxy.lock().take() {
            proxy.stop();
        }
        self.target.switch(None);

        for name in [EnvName::Blue, EnvName::Green] {
            let (port, running) = {
                let state = self.state.lock();
                let env = state.env(name);
                (
                    env.port,
                    matches!(
                        env.status,
                        EnvStatus::Starting | EnvStatus::Healthy | EnvStatus::Unhealthy
                    ),
                )
            };
            if running {
                match self.runtime.stop_instance(port, self.config.stop_timeout).await {
                    Ok(()) | Err(RuntimeError::NotRunning(_)) => {}
                    Err(e) => tracing::debug!(env = %name, error = %e, "environment stop"),
                }
                self.state.lock().env_mut(name).status = EnvStatus::Stopped;
                self.events.emit(Event::EnvironmentStopped {
                    name: name.to_string(),
                });
            }
        }
    }
}

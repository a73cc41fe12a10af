// ABOUTME: Configuration types and parsing for cutover.yml.
// ABOUTME: Handles YAML parsing, discovery, and per-strategy option sections.

mod backup;
mod checks;
mod pool;
mod shutdown;

pub use backup::BackupConfig;
pub use checks::{CheckConfig, CheckKind};
pub use pool::PoolFraction;
pub use shutdown::{HookConfig, ShutdownConfig};

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "cutover.yml";
pub const CONFIG_FILENAME_ALT: &str = "cutover.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".cutover/config.yml";

/// Which rollout strategy drives a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RollingUpdate,
    BlueGreen,
    Canary,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::RollingUpdate => "rolling_update",
            Strategy::BlueGreen => "blue_green",
            Strategy::Canary => "canary",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: String,

    /// Shell command that launches one application instance. The runtime
    /// injects CUTOVER_PORT, CUTOVER_VERSION, and CUTOVER_ARTIFACT into
    /// its environment.
    pub command: String,

    #[serde(default = "default_strategy")]
    pub strategy: Strategy,

    /// Ports of the fixed instance pool (rolling update and canary).
    #[serde(default)]
    pub instances: Vec<u16>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub rolling: RollingConfig,

    #[serde(default)]
    pub blue_green: BlueGreenConfig,

    #[serde(default)]
    pub canary: CanaryConfig,

    #[serde(default)]
    pub backup: Option<BackupConfig>,

    #[serde(default)]
    pub pre_deployment_checks: Vec<CheckConfig>,

    #[serde(default)]
    pub post_deployment_checks: Vec<CheckConfig>,

    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Health probe target and retry budget, shared by every strategy.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_path")]
    pub path: String,

    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default = "default_health_retries")]
    pub retries: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            timeout: default_health_timeout(),
            retries: default_health_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RollingConfig {
    #[serde(default = "default_max_unavailable")]
    pub max_unavailable: PoolFraction,

    #[serde(default = "default_max_surge")]
    pub max_surge: PoolFraction,

    #[serde(default = "default_batch_size")]
    pub update_batch_size: usize,

    #[serde(default = "default_update_delay", with = "humantime_serde")]
    pub update_delay: Duration,

    #[serde(
        default = "default_graceful_shutdown_timeout",
        with = "humantime_serde"
    )]
    pub graceful_shutdown_timeout: Duration,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            max_unavailable: default_max_unavailable(),
            max_surge: default_max_surge(),
            update_batch_size: default_batch_size(),
            update_delay: default_update_delay(),
            graceful_shutdown_timeout: default_graceful_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlueGreenConfig {
    #[serde(default = "default_blue_port")]
    pub blue_port: u16,

    #[serde(default = "default_green_port")]
    pub green_port: u16,

    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    #[serde(default = "default_switch_delay", with = "humantime_serde")]
    pub traffic_switch_delay: Duration,

    #[serde(default = "default_env_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for BlueGreenConfig {
    fn default() -> Self {
        Self {
            blue_port: default_blue_port(),
            green_port: default_green_port(),
            proxy_port: default_proxy_port(),
            traffic_switch_delay: default_switch_delay(),
            stop_timeout: default_env_stop_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanaryConfig {
    /// How long the canary set is observed before ramping traffic.
    #[serde(default = "default_observation_window", with = "humantime_serde")]
    pub observation_window: Duration,

    /// Pause between traffic ramp steps (25% → 50% → 75% → 100%).
    #[serde(default = "default_ramp_delay", with = "humantime_serde")]
    pub ramp_delay: Duration,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            observation_window: default_observation_window(),
            ramp_delay: default_ramp_delay(),
        }
    }
}

fn default_strategy() -> Strategy {
    Strategy::RollingUpdate
}

fn default_true() -> bool {
    true
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_health_retries() -> u32 {
    10
}

fn default_max_unavailable() -> PoolFraction {
    PoolFraction::Percent(25)
}

fn default_max_surge() -> PoolFraction {
    PoolFraction::Count(0)
}

fn default_batch_size() -> usize {
    1
}

fn default_update_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_graceful_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_blue_port() -> u16 {
    3000
}

fn default_green_port() -> u16 {
    3001
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_switch_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_env_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_observation_window() -> Duration {
    Duration::from_secs(30)
}

fn default_ramp_delay() -> Duration {
    Duration::from_secs(10)
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn discover(dir: &Path) -> Result<Self> {
        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_DIR),
        ];

        for path in &candidates {
            if path.exists() {
                return Self::load(path);
            }
        }

        Err(Error::ConfigNotFound(dir.to_path_buf()))
    }

    fn validate(&self) -> Result<()> {
        if self.service.trim().is_empty() {
            return Err(Error::InvalidConfig("service must not be empty".into()));
        }
        if self.command.trim().is_empty() {
            return Err(Error::InvalidConfig("command must not be empty".into()));
        }
        match self.strategy {
            Strategy::RollingUpdate | Strategy::Canary => {
                if self.instances.is_empty() {
                    return Err(Error::InvalidConfig(format!(
                        "strategy {} requires a non-empty instances list",
                        self.strategy
                    )));
                }
            }
            Strategy::BlueGreen => {
                let bg = &self.blue_green;
                if bg.blue_port == bg.green_port {
                    return Err(Error::InvalidConfig(
                        "blue_port and green_port must differ".into(),
                    ));
                }
                if bg.proxy_port == bg.blue_port || bg.proxy_port == bg.green_port {
                    return Err(Error::InvalidConfig(
                        "proxy_port must not collide with an environment port".into(),
                    ));
                }
            }
        }
        if self.rolling.update_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "update_batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn template() -> Self {
        Config {
            service: "my-app".to_string(),
            command: "./my-app --port $CUTOVER_PORT".to_string(),
            strategy: Strategy::RollingUpdate,
            instances: vec![8081, 8082, 8083, 8084],
            health: HealthConfig::default(),
            rolling: RollingConfig::default(),
            blue_green: BlueGreenConfig::default(),
            canary: CanaryConfig::default(),
            backup: None,
            pre_deployment_checks: vec![],
            post_deployment_checks: vec![],
            rollback_on_failure: true,
            shutdown: ShutdownConfig::default(),
        }
    }
}

pub fn init_config(dir: &Path, service: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = dir.join(CONFIG_FILENAME);

    if config_path.exists() && !force {
        return Err(Error::AlreadyExists(config_path));
    }

    let service = service.unwrap_or("my-app");
    let yaml = format!(
        r#"service: {service}
command: ./{service} --port $CUTOVER_PORT
strategy: rolling_update
instances:
  - 8081
  - 8082
health:
  path: /health
  timeout: 5s
  retries: 10
rolling:
  max_unavailable: "25%"
  update_batch_size: 1
  update_delay: 5s
"#
    );
    std::fs::write(&config_path, yaml)?;

    Ok(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
service: api
command: ./api --port $CUTOVER_PORT
instances: [8081, 8082]
"#
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::from_yaml(minimal_yaml()).unwrap();
        assert_eq!(config.strategy, Strategy::RollingUpdate);
        assert_eq!(config.health.path, "/health");
        assert_eq!(config.health.retries, 10);
        assert!(config.rollback_on_failure);
        assert_eq!(config.rolling.update_batch_size, 1);
    }

    #[test]
    fn rejects_rolling_without_instances() {
        let yaml = r#"
service: api
command: ./api
instances: []
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn rejects_colliding_blue_green_ports() {
        let yaml = r#"
service: api
command: ./api
strategy: blue_green
blue_green:
  blue_port: 3000
  green_port: 3000
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn parses_blue_green_section() {
        let yaml = r#"
service: api
command: ./api
strategy: blue_green
blue_green:
  blue_port: 3000
  green_port: 3001
  proxy_port: 8080
  traffic_switch_delay: 250ms
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.blue_green.proxy_port, 8080);
        assert_eq!(
            config.blue_green.traffic_switch_delay,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn parses_checks_and_hooks() {
        let yaml = r#"
service: api
command: ./api
instances: [9000]
pre_deployment_checks:
  - name: db-migrations
    type: database_migration
    command: ./migrate --check
    required: true
post_deployment_checks:
  - name: smoke
    type: smoke_test
    command: ./smoke.sh
    retries: 2
shutdown:
  graceful_timeout: 15s
  force_timeout: 30s
  hooks:
    - name: flush-metrics
      priority: 10
      timeout: 5s
      required: false
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.pre_deployment_checks.len(), 1);
        assert_eq!(config.post_deployment_checks[0].retries, 2);
        assert_eq!(config.shutdown.hooks[0].name, "flush-metrics");
        assert_eq!(config.shutdown.graceful_timeout, Duration::from_secs(15));
    }
}

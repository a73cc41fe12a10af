// ABOUTME: End-to-end pipeline tests: deploy, upgrade, rollback, and the
// ABOUTME: canary rollout, all against loopback instances and a fake runtime.

mod support;

use cutover::config::{CheckConfig, CheckKind, Config, Strategy};
use cutover::deploy::{DeployError, DeploymentManager, DeploymentStatus};
use cutover::events::{Event, EventBus, EventSink};
use cutover::health::HealthProbe;
use cutover::rolling::RollingUpdateManager;
use cutover::types::Version;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use support::{FakeRuntime, serve_ok};

struct Recorder(Mutex<Vec<Event>>);

impl EventSink for Recorder {
    fn dispatch(&self, event: &Event) {
        self.0.lock().push(event.clone());
    }
}

async fn live_config(instances: usize) -> Config {
    let mut ports = Vec::new();
    for _ in 0..instances {
        ports.push(serve_ok("ok").await);
    }

    let mut config = Config::template();
    config.instances = ports;
    config.backup = None;
    config.health.timeout = Duration::from_secs(1);
    config.health.retries = 2;
    config.rolling.update_delay = Duration::ZERO;
    config.rolling.graceful_shutdown_timeout = Duration::from_millis(100);
    config.canary.observation_window = Duration::from_millis(100);
    config.canary.ramp_delay = Duration::ZERO;
    config
}

fn build_manager(config: Config, events: EventBus) -> DeploymentManager {
    let probe = HealthProbe::new(config.health.path.clone(), config.health.timeout);
    let rolling = Arc::new(RollingUpdateManager::new(
        Arc::new(FakeRuntime::default()),
        probe,
        config.rolling.clone(),
        config.health.retries,
        config.rollback_on_failure,
        events.clone(),
    ));
    DeploymentManager::new(config, events, rolling, None)
}

fn artifact(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"artifact bytes").unwrap();
    path
}

fn version(s: &str) -> Version {
    Version::new(s).unwrap()
}

#[tokio::test]
async fn deploy_upgrade_and_roll_back() {
    let dir = tempfile::tempdir().unwrap();
    let manager = build_manager(live_config(2).await, EventBus::new());

    // First deployment starts the pool; there is nothing to roll back to.
    let first = manager
        .deploy(&artifact(dir.path(), "app-1.tar.gz"), version("1.0.0"))
        .await
        .unwrap();
    let record = manager.find(&first).unwrap();
    assert_eq!(record.status, DeploymentStatus::Completed);
    assert!(!record.rollback_available);
    assert_eq!(manager.current_version(), Some(version("1.0.0")));

    // Upgrade; this one can be rolled back.
    let second = manager
        .deploy(&artifact(dir.path(), "app-2.tar.gz"), version("2.0.0"))
        .await
        .unwrap();
    assert!(manager.find(&second).unwrap().rollback_available);
    assert_eq!(manager.current_version(), Some(version("2.0.0")));

    let rolled = manager.rollback(None).await.unwrap();
    assert_eq!(rolled, second);
    assert_eq!(
        manager.find(&second).unwrap().status,
        DeploymentStatus::RolledBack
    );
    assert_eq!(manager.current_version(), Some(version("1.0.0")));

    // The rollback is consumed: nothing else is eligible.
    assert!(matches!(
        manager.rollback(None).await.unwrap_err(),
        DeployError::NoRollbackTarget
    ));
    assert!(matches!(
        manager.rollback(Some(second)).await.unwrap_err(),
        DeployError::AlreadyRolledBack
    ));
}

#[tokio::test]
async fn concurrent_deploys_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let manager = build_manager(live_config(2).await, EventBus::new());
    let a = artifact(dir.path(), "app-a.tar.gz");
    let b = artifact(dir.path(), "app-b.tar.gz");

    let (first, second) = tokio::join!(
        manager.deploy(&a, version("1.0.0")),
        manager.deploy(&b, version("1.0.1")),
    );

    assert!(first.is_ok());
    assert!(matches!(
        second.unwrap_err(),
        DeployError::AlreadyInProgress
    ));
}

#[tokio::test]
async fn failed_post_check_rolls_the_pool_back() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("second-deploy");

    let mut config = live_config(2).await;
    // Passes while the marker file is absent, fails once it exists.
    config.post_deployment_checks = vec![CheckConfig {
        name: "smoke".to_string(),
        kind: CheckKind::SmokeTest,
        command: Some(format!("test ! -f {}", marker.display())),
        url: None,
        required: true,
        timeout: Duration::from_secs(5),
        retries: 0,
    }];
    let manager = build_manager(config, EventBus::new());

    manager
        .deploy(&artifact(dir.path(), "app-1.tar.gz"), version("1.0.0"))
        .await
        .unwrap();

    std::fs::write(&marker, b"").unwrap();
    let err = manager
        .deploy(&artifact(dir.path(), "app-2.tar.gz"), version("2.0.0"))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::RequiredCheckFailed { .. }));

    // The automatic rollback restored the previous version everywhere.
    let record = manager.latest().unwrap();
    assert_eq!(record.status, DeploymentStatus::RolledBack);
    assert_eq!(manager.current_version(), Some(version("1.0.0")));
}

#[tokio::test]
async fn canary_updates_subset_then_promotes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = live_config(3).await;
    config.strategy = Strategy::Canary;

    let events = EventBus::new();
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    events.register(recorder.clone());

    let manager = build_manager(config, events);

    manager
        .deploy(&artifact(dir.path(), "app-1.tar.gz"), version("1.0.0"))
        .await
        .unwrap();
    let id = manager
        .deploy(&artifact(dir.path(), "app-2.tar.gz"), version("2.0.0"))
        .await
        .unwrap();

    let record = manager.find(&id).unwrap();
    assert_eq!(record.status, DeploymentStatus::Completed);
    assert!(record.instances.iter().all(|i| i.version == version("2.0.0")));

    let ramps: Vec<u8> = recorder
        .0
        .lock()
        .iter()
        .filter_map(|event| match event {
            Event::CanaryTrafficRamp { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(ramps, vec![25, 50, 75, 100]);
}

// ABOUTME: Integration tests for the rolling update strategy against live
// ABOUTME: loopback health endpoints and a recording fake runtime.

mod support;

use cutover::config::{PoolFraction, RollingConfig};
use cutover::deploy::InstanceStatus;
use cutover::events::EventBus;
use cutover::health::HealthProbe;
use cutover::rolling::{RollingError, RollingUpdateManager};
use cutover::types::Version;
use proptest::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use support::{FakeRuntime, serve_ok};

fn rolling_config(batch_size: usize, max_unavailable: PoolFraction) -> RollingConfig {
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

#[tokio::test]
async fn whole_pool_updates_batch_by_batch() {
    let mut ports = Vec::new();
    for _ in 0..4 {
        ports.push(serve_ok("ok").await);
    }

    let runtime = Arc::new(FakeRuntime::default());
    let manager = RollingUpdateManager::new(
        runtime.clone(),
        HealthProbe::new("/health", Duration::from_secs(1)),
        rolling_config(1, PoolFraction::Count(1)),
        2,
        true,
        EventBus::new(),
    );

    manager.initialize_pool(&ports, &version("1.0.0"));
    manager
        .update_pool(&PathBuf::from("/tmp/app-2.tar.gz"), Some(&version("1.0.0")), &version("2.0.0"))
        .await
        .unwrap();

    let pool = manager.pool_snapshot();
    assert!(pool.iter().all(|i| i.status == InstanceStatus::Healthy));
    assert!(pool.iter().all(|i| i.version == version("2.0.0")));

    // With batch size 1, each instance is fully replaced before the next
    // one is touched: stop(n) start(n) precede stop(n+1).
    let ops = runtime.ops();
    for pair in ports.windows(2) {
        let start_a = ops
            .iter()
            .position(|op| op == &format!("start {} 2.0.0", pair[0]))
            .unwrap();
        let stop_b = ops
            .iter()
            .position(|op| op == &format!("stop {}", pair[1]))
            .unwrap();
        assert!(start_a < stop_b, "ops: {ops:?}");
    }
}

#[tokio::test]
async fn batch_members_stage_concurrently() {
    let mut ports = Vec::new();
    for _ in 0..4 {
        ports.push(serve_ok("ok").await);
    }

    // Two members per batch; both suspend inside stage_artifact at the
    // same time, which must not wedge on the artifact registry.
    let runtime = Arc::new(FakeRuntime::default());
    let manager = RollingUpdateManager::new(
        runtime.clone(),
        HealthProbe::new("/health", Duration::from_secs(1)),
        rolling_config(2, PoolFraction::Count(2)),
        2,
        true,
        EventBus::new(),
    );

    manager.initialize_pool(&ports, &version("1.0.0"));
    tokio::time::timeout(
        Duration::from_secs(10),
        manager.update_pool(
            &PathBuf::from("/tmp/app-2.tar.gz"),
            Some(&version("1.0.0")),
            &version("2.0.0"),
        ),
    )
    .await
    .expect("batched update finishes")
    .unwrap();

    let pool = manager.pool_snapshot();
    assert!(pool.iter().all(|i| i.status == InstanceStatus::Healthy));
    assert!(pool.iter().all(|i| i.version == version("2.0.0")));
    assert_eq!(
        runtime.ops().iter().filter(|op| op.starts_with("stage")).count(),
        4
    );
}

#[tokio::test]
async fn failed_member_triggers_pool_rollback() {
    let good = serve_ok("ok").await;
    // Nothing listens on this port, so the second batch never goes healthy.
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    };

    let runtime = Arc::new(FakeRuntime::default());
    let manager = RollingUpdateManager::new(
        runtime.clone(),
        HealthProbe::new("/health", Duration::from_millis(200)),
        rolling_config(1, PoolFraction::Count(1)),
        1,
        true,
        EventBus::new(),
    );

    manager.initialize_pool(&[good, dead], &version("1.0.0"));
    manager.register_artifact(&version("1.0.0"), &PathBuf::from("/tmp/app-1.tar.gz"));

    let err = manager
        .update_pool(&PathBuf::from("/tmp/app-2.tar.gz"), Some(&version("1.0.0")), &version("2.0.0"))
        .await
        .unwrap_err();

    assert!(matches!(err, RollingError::RolledBackAfterFailure { .. }));

    // The first instance was updated and then rolled back to 1.0.0.
    let pool = manager.pool_snapshot();
    assert_eq!(pool[0].version, version("1.0.0"));
    assert_eq!(pool[0].status, InstanceStatus::Healthy);
    assert_eq!(pool[1].status, InstanceStatus::Unhealthy);
}

#[tokio::test]
async fn no_rollback_when_disabled() {
    let good = serve_ok("ok").await;
    let dead = 1u16;

    let manager = RollingUpdateManager::new(
        Arc::new(FakeRuntime::default()),
        HealthProbe::new("/health", Duration::from_millis(200)),
        rolling_config(1, PoolFraction::Count(1)),
        1,
        false,
        EventBus::new(),
    );

    manager.initialize_pool(&[good, dead], &version("1.0.0"));
    let err = manager
        .update_pool(&PathBuf::from("/tmp/app-2.tar.gz"), Some(&version("1.0.0")), &version("2.0.0"))
        .await
        .unwrap_err();

    assert!(matches!(err, RollingError::BatchFailed { .. }));
    // The already-updated instance stays on the new version.
    assert_eq!(manager.pool_snapshot()[0].version, version("2.0.0"));
}

proptest! {
    #[test]
    fn percent_fraction_rounds_up_and_never_exceeds_pool(
        percent in 1u32..=100,
        pool in 1usize..=64,
    ) {
        let resolved = PoolFraction::Percent(percent).resolve(pool);
        let expected = (percent as usize * pool).div_ceil(100);
        prop_assert_eq!(resolved, expected);
        prop_assert!(resolved >= 1);
        prop_assert!(resolved <= pool);
    }

    #[test]
    fn count_fraction_is_identity(count in 0usize..=64, pool in 1usize..=64) {
        prop_assert_eq!(PoolFraction::Count(count).resolve(pool), count);
    }
}

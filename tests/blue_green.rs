// ABOUTME: Blue-green integration tests: proxy pass-through semantics and the
// ABOUTME: full deploy / switch / rollback lifecycle against loopback servers.

mod support;

use cutover::bluegreen::{
    BlueGreenDeployment, BlueGreenError, EnvName, EnvStatus, ProxyTarget, ReverseProxy,
};
use cutover::config::{BlueGreenConfig, ShutdownConfig};
use cutover::events::EventBus;
use cutover::health::HealthProbe;
use cutover::shutdown::GracefulShutdownManager;
use cutover::types::Version;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use support::{FakeRuntime, http_get, serve_ok, serve_slow};

fn version(s: &str) -> Version {
    Version::new(s).unwrap()
}

#[tokio::test]
async fn proxy_answers_503_then_forwards_then_502() {
    let target = ProxyTarget::new();
    let proxy = ReverseProxy::bind(0, target.clone(), None).await.unwrap();
    let addr = proxy.local_addr().to_string();

    // No active environment yet.
    let (status, body) = http_get(&addr, "/").await;
    assert_eq!(status, 503);
    assert_eq!(body, "no active environment");

    // Point at a live upstream: requests pass through untouched.
    let upstream = serve_ok("hello from upstream").await;
    target.switch(Some(upstream));
    let (status, body) = http_get(&addr, "/anything").await;
    assert_eq!(status, 200);
    assert_eq!(body, "hello from upstream");

    // Point at a dead port: the proxy reports a bad gateway.
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    };
    target.switch(Some(dead));
    let (status, body) = http_get(&addr, "/").await;
    assert_eq!(status, 502);
    assert_eq!(body, "upstream unavailable");

    proxy.stop();
}

fn deployment_for(blue: u16, green: u16) -> BlueGreenDeployment {
    let config = BlueGreenConfig {
        blue_port: blue,
        green_port: green,
        proxy_port: 0,
        traffic_switch_delay: Duration::ZERO,
        stop_timeout: Duration::from_millis(100),
    };
    BlueGreenDeployment::new(
        config,
        Arc::new(FakeRuntime::default()),
        HealthProbe::new("/health", Duration::from_secs(1)),
        2,
        EventBus::new(),
        None,
    )
}

#[tokio::test]
async fn proxy_connections_count_toward_drain() {
    let target = ProxyTarget::new();
    let shutdown = Arc::new(GracefulShutdownManager::new(
        ShutdownConfig::default(),
        EventBus::new(),
    ));
    let proxy = ReverseProxy::bind(0, target.clone(), Some(Arc::clone(&shutdown)))
        .await
        .unwrap();
    let addr = proxy.local_addr().to_string();

    let upstream = serve_slow("eventually", Duration::from_millis(500)).await;
    target.switch(Some(upstream));

    // While the upstream dawdles, the request is a tracked connection.
    let request = tokio::spawn({
        let addr = addr.clone();
        async move { http_get(&addr, "/").await }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(shutdown.active_connections(), 1);

    let (status, body) = request.await.unwrap();
    assert_eq!((status, body.as_str()), (200, "eventually"));

    // Once the client disconnects, the guard drops off the ledger.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(shutdown.active_connections(), 0);

    proxy.stop();
}

#[tokio::test]
async fn deploy_switch_and_roll_back() {
    let blue = serve_ok("blue").await;
    let green = serve_ok("green").await;
    let deployment = deployment_for(blue, green);
    deployment.initialize().await.unwrap();

    // First deploy lands in blue.
    deployment
        .deploy(Path::new("/tmp/app-1.tar.gz"), &version("1.0.0"))
        .await
        .unwrap();
    assert_eq!(deployment.active_environment(), Some(EnvName::Blue));

    let proxy = deployment.proxy_addr().unwrap().to_string();
    let (status, body) = http_get(&proxy, "/").await;
    assert_eq!((status, body.as_str()), (200, "blue"));

    // Second deploy lands in green; blue is stopped after the switch.
    deployment
        .deploy(Path::new("/tmp/app-2.tar.gz"), &version("2.0.0"))
        .await
        .unwrap();
    assert_eq!(deployment.active_environment(), Some(EnvName::Green));
    let (_, body) = http_get(&proxy, "/").await;
    assert_eq!(body, "green");

    let status = deployment.status();
    assert_eq!(status.blue.status, EnvStatus::Stopped);
    assert_eq!(status.green.status, EnvStatus::Healthy);
    assert_eq!(status.blue.version, Some(version("1.0.0")));

    // Rollback restarts blue and switches traffic back.
    deployment.rollback().await.unwrap();
    assert_eq!(deployment.active_environment(), Some(EnvName::Blue));
    let (_, body) = http_get(&proxy, "/").await;
    assert_eq!(body, "blue");

    deployment.shutdown().await;
}

#[tokio::test]
async fn rollback_without_history_is_rejected() {
    let blue = serve_ok("blue").await;
    let green = serve_ok("green").await;
    let deployment = deployment_for(blue, green);
    deployment.initialize().await.unwrap();

    assert!(matches!(
        deployment.rollback().await.unwrap_err(),
        BlueGreenError::NothingToRollBack
    ));

    deployment.shutdown().await;
}

#[tokio::test]
async fn unhealthy_target_aborts_the_deploy() {
    let blue = serve_ok("blue").await;
    // Nothing listens on the green port.
    let green = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    };
    let deployment = deployment_for(blue, green);
    deployment.initialize().await.unwrap();

    deployment
        .deploy(Path::new("/tmp/app-1.tar.gz"), &version("1.0.0"))
        .await
        .unwrap();
    assert_eq!(deployment.active_environment(), Some(EnvName::Blue));

    // The second deploy targets green, which never becomes healthy.
    let err = deployment
        .deploy(Path::new("/tmp/app-2.tar.gz"), &version("2.0.0"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BlueGreenError::EnvironmentUnhealthy {
            name: EnvName::Green,
            ..
        }
    ));

    // Traffic never moved off blue.
    assert_eq!(deployment.active_environment(), Some(EnvName::Blue));
    let proxy = deployment.proxy_addr().unwrap().to_string();
    let (_, body) = http_get(&proxy, "/").await;
    assert_eq!(body, "blue");

    deployment.shutdown().await;
}

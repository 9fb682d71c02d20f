//! Control-surface regression tests.
//!
//! Drives the full daemon assembly — reconciler, health monitor, control
//! router — against the in-memory hypervisor, exercising the same paths
//! the CLI uses.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tokio::sync::watch;
use tower::ServiceExt;

use virtscale_fleet::{Config, FleetSnapshot, LifecycleState};
use virtscale_health::HealthMonitor;
use virtscale_hypervisor::FakeHypervisor;
use virtscale_net::NetworkProvisioner;
use virtscale_provision::DomainProvisioner;
use virtscale_scaler::{Reconciler, ScalerHandle};
use virtscaled::api::build_router;

struct TestDaemon {
    handle: ScalerHandle,
    router: Router,
    hv: Arc<FakeHypervisor>,
    reconciler_task: tokio::task::JoinHandle<()>,
    _shutdown_tx: watch::Sender<bool>,
    _workdir: tempfile::TempDir,
}

fn test_config(workdir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.workdir = workdir.to_path_buf();
    config.instance.iso_path = "/srv/images/guest.iso".into();
    config.scaler.initial_replicas = 0;
    config.scaler.pass_interval_secs = 1;
    config.scaler.shutdown_timeout_secs = 5;
    config.health.interval_secs = 1;
    config.health.timeout_ms = 200;
    config.health.unhealthy_threshold = 2;
    config.health.start_delay_secs = 0;
    config
}

/// Assemble reconciler + router (+ optionally the health monitor) on the
/// fake hypervisor, with the reconciler loop running.
async fn spawn_daemon(with_monitor: bool) -> TestDaemon {
    let workdir = tempfile::tempdir().unwrap();
    let config = test_config(workdir.path());

    let hv = Arc::new(FakeHypervisor::new());
    let network_prov = NetworkProvisioner::new(config.network_name(), config.network.subnet);
    let network = network_prov.ensure(hv.as_ref()).await.unwrap();
    let provisioner = Arc::new(DomainProvisioner::new(Arc::clone(&hv), network, &config));

    let (mut reconciler, handle, events_tx) = Reconciler::new(
        Arc::clone(&hv),
        provisioner,
        network_prov,
        config.scaler.clone(),
    );
    reconciler.adopt_existing().await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if with_monitor {
        let monitor = HealthMonitor::new(
            config.health.clone(),
            // Nothing listens on port 1, so every probe fails.
            1,
            handle.subscribe(),
            events_tx,
        );
        tokio::spawn(monitor.run(shutdown_rx));
    } else {
        drop(events_tx);
        drop(shutdown_rx);
    }

    let reconciler_task = tokio::spawn(reconciler.run());
    let router = build_router(handle.clone());

    TestDaemon {
        handle,
        router,
        hv,
        reconciler_task,
        _shutdown_tx: shutdown_tx,
        _workdir: workdir,
    }
}

async fn get_state(router: &Router) -> FleetSnapshot {
    let resp = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/state")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn post_scale(router: &Router, body: &str) -> StatusCode {
    let resp = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/scale")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    resp.status()
}

async fn wait_for<F>(handle: &ScalerHandle, secs: u64, predicate: F) -> FleetSnapshot
where
    F: FnMut(&FleetSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(secs), handle.wait_for(predicate))
        .await
        .expect("snapshot condition timed out")
        .expect("reconciler stopped early")
}

#[tokio::test]
async fn state_starts_empty() {
    let daemon = spawn_daemon(false).await;
    let snapshot = get_state(&daemon.router).await;
    assert_eq!(snapshot.desired, 0);
    assert!(snapshot.instances.is_empty());
}

#[tokio::test]
async fn scale_through_api_converges() {
    let daemon = spawn_daemon(false).await;

    assert_eq!(post_scale(&daemon.router, r#"{"count":3}"#).await, StatusCode::ACCEPTED);

    wait_for(&daemon.handle, 15, |s| {
        s.desired == 3
            && s.instances.len() == 3
            && s.instances
                .iter()
                .all(|i| i.lifecycle_state == LifecycleState::Running)
    })
    .await;

    let snapshot = get_state(&daemon.router).await;
    assert_eq!(snapshot.instances.len(), 3);
    assert_eq!(daemon.hv.running_domains().len(), 3);
}

#[tokio::test]
async fn negative_scale_is_rejected_as_invalid_argument() {
    let daemon = spawn_daemon(false).await;

    assert_eq!(
        post_scale(&daemon.router, r#"{"count":-2}"#).await,
        StatusCode::BAD_REQUEST
    );

    // Nothing was enqueued.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = get_state(&daemon.router).await;
    assert_eq!(snapshot.desired, 0);
}

#[tokio::test]
async fn malformed_scale_body_is_a_client_error() {
    let daemon = spawn_daemon(false).await;
    let status = post_scale(&daemon.router, "not json at all").await;
    assert!(status.is_client_error(), "got {status}");
}

#[tokio::test]
async fn unreachable_instance_is_replaced_automatically() {
    let daemon = spawn_daemon(true).await;

    assert_eq!(post_scale(&daemon.router, r#"{"count":1}"#).await, StatusCode::ACCEPTED);
    let snapshot = wait_for(&daemon.handle, 15, |s| s.instances.len() == 1).await;
    let original = snapshot.instances[0].id.clone();

    // Probes against the closed port cross the threshold; the monitor
    // requests replacement and the reconciler provisions a successor.
    wait_for(&daemon.handle, 30, |s| {
        s.instances.iter().any(|i| i.id != original)
    })
    .await;
}

#[tokio::test]
async fn stop_drains_fleet_and_network() {
    let daemon = spawn_daemon(false).await;

    assert_eq!(post_scale(&daemon.router, r#"{"count":2}"#).await, StatusCode::ACCEPTED);
    wait_for(&daemon.handle, 15, |s| s.instances.len() == 2).await;

    daemon.handle.stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), daemon.reconciler_task)
        .await
        .expect("shutdown timed out")
        .unwrap();

    assert!(daemon.hv.running_domains().is_empty());
    assert!(!daemon.hv.has_network("vsd-net"));
}

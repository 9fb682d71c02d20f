//! Daemon assembly and lifecycle.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use virtscale_fleet::Config;
use virtscale_health::HealthMonitor;
use virtscale_hypervisor::Hypervisor;
use virtscale_net::NetworkProvisioner;
use virtscale_provision::DomainProvisioner;
use virtscale_scaler::Reconciler;

use crate::{api, pidfile};

/// Run the daemon until a shutdown signal arrives.
///
/// Startup order matters: the hypervisor must answer and the shared
/// network must exist before anything else — both failures are fatal and
/// exit nonzero with a diagnostic. The fleet is then rebuilt from the
/// hypervisor's live domain list before the loop starts.
pub async fn run<H: Hypervisor + 'static>(hv: Arc<H>, config: Config) -> anyhow::Result<()> {
    config.validate()?;
    std::fs::create_dir_all(&config.workdir)
        .with_context(|| format!("failed to create workdir {}", config.workdir.display()))?;

    hv.ping()
        .await
        .context("cannot reach hypervisor; refusing to start")?;

    let network_prov = NetworkProvisioner::new(config.network_name(), config.network.subnet);
    let network = network_prov
        .ensure(hv.as_ref())
        .await
        .context("failed to provision the shared NAT network; cannot run without it")?;

    let provisioner = Arc::new(DomainProvisioner::new(Arc::clone(&hv), network, &config));
    let (mut reconciler, handle, events_tx) = Reconciler::new(
        Arc::clone(&hv),
        provisioner,
        network_prov,
        config.scaler.clone(),
    );

    let adopted = reconciler
        .adopt_existing()
        .await
        .context("failed to rebuild fleet from hypervisor")?;
    info!(adopted, desired = config.scaler.initial_replicas, "fleet initialized");

    let pid_path = pidfile::path(&config.workdir);
    pidfile::write(&pid_path).context("failed to write pidfile")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = HealthMonitor::new(
        config.health.clone(),
        config.instance.health_port,
        handle.subscribe(),
        events_tx,
    );
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx));
    let reconciler_task = tokio::spawn(reconciler.run());

    let router = api::build_router(handle.clone());
    let listener = tokio::net::TcpListener::bind(config.control.listen)
        .await
        .with_context(|| format!("failed to bind control API on {}", config.control.listen))?;
    info!(addr = %config.control.listen, "control API listening");

    let signal_handle = handle.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = signal_handle.stop().await;
        let _ = shutdown_tx.send(true);
    });
    server.await.context("control API server failed")?;

    // The reconciler drains the fleet and tears the network down on its
    // way out; wait for that before dropping the pidfile.
    let _ = reconciler_task.await;
    let _ = monitor_task.await;

    pidfile::remove(&pid_path);
    info!("daemon stopped");
    Ok(())
}

async fn wait_for_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

//! The health monitor loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info};

use virtscale_fleet::{FleetSnapshot, HealthConfig, InstanceId};

use crate::probe::{tcp_probe, ProbeResult};
use crate::tracker::{HealthTracker, ProbeStatus};

/// Reports flowing from the monitor to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// Outcome of one probe, with the tracker's view after recording it.
    Probe {
        id: InstanceId,
        status: ProbeStatus,
        consecutive_failures: u32,
    },
    /// The instance crossed the failure threshold and should be replaced.
    /// Emitted once per crossing; the reconciler deduplicates regardless.
    Replace { id: InstanceId },
}

/// Probes all tracked instances on a fixed interval.
pub struct HealthMonitor {
    config: HealthConfig,
    /// Guest port probed on every instance.
    port: u16,
    snapshot_rx: watch::Receiver<FleetSnapshot>,
    events_tx: mpsc::Sender<HealthEvent>,
    trackers: HashMap<InstanceId, HealthTracker>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        port: u16,
        snapshot_rx: watch::Receiver<FleetSnapshot>,
        events_tx: mpsc::Sender<HealthEvent>,
    ) -> Self {
        Self {
            config,
            port,
            snapshot_rx,
            events_tx,
            trackers: HashMap::new(),
        }
    }

    /// Run probe rounds until shutdown. Probing runs on its own schedule;
    /// a slow hypervisor call elsewhere never delays a round.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.interval_secs);
        info!(
            interval_secs = self.config.interval_secs,
            port = self.port,
            "health monitor started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.probe_round().await.is_err() {
                        // Reconciler went away; nothing left to report to.
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }
    }

    /// Probe every eligible instance once, concurrently, and report the
    /// outcomes. Returns `Err` when the event channel is closed.
    pub async fn probe_round(&mut self) -> Result<(), mpsc::error::SendError<HealthEvent>> {
        let snapshot = self.snapshot_rx.borrow().clone();
        let now = epoch_secs();

        // Drop trackers for instances that left the fleet.
        let live: std::collections::HashSet<&InstanceId> =
            snapshot.instances.iter().map(|i| &i.id).collect();
        self.trackers.retain(|id, _| live.contains(id));

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let semaphore = Arc::new(Semaphore::new(self.config.probe_concurrency.max(1)));

        let probes = snapshot.instances.iter().filter(|inst| {
            inst.lifecycle_state.is_probeable()
                && now.saturating_sub(inst.started_at) >= self.config.start_delay_secs
        });

        let attempts: Vec<_> = probes
            .map(|inst| {
                let id = inst.id.clone();
                let addr = SocketAddr::from((inst.ip_address, self.port));
                let semaphore = Arc::clone(&semaphore);
                async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    (id, tcp_probe(addr, timeout).await)
                }
            })
            .collect();

        if attempts.is_empty() {
            return Ok(());
        }
        debug!(count = attempts.len(), "probe round");

        let outcomes = futures::future::join_all(attempts).await;

        for (id, result) in outcomes {
            let tracker = self
                .trackers
                .entry(id.clone())
                .or_insert_with(|| {
                    HealthTracker::new(
                        self.config.unhealthy_threshold,
                        self.config.healthy_threshold,
                    )
                });
            let previous = tracker.status();
            let status = tracker.record(result);
            let consecutive_failures = tracker.consecutive_failures();

            self.events_tx
                .send(HealthEvent::Probe {
                    id: id.clone(),
                    status,
                    consecutive_failures,
                })
                .await?;

            if status == ProbeStatus::Unhealthy && previous != ProbeStatus::Unhealthy {
                self.events_tx.send(HealthEvent::Replace { id }).await?;
            }
        }
        Ok(())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use virtscale_fleet::{InstanceSnapshot, LifecycleState};

    fn fast_config(unhealthy_threshold: u32) -> HealthConfig {
        HealthConfig {
            interval_secs: 1,
            timeout_ms: 200,
            unhealthy_threshold,
            healthy_threshold: 1,
            start_delay_secs: 0,
            probe_concurrency: 4,
        }
    }

    fn snapshot_with(instances: Vec<InstanceSnapshot>) -> watch::Receiver<FleetSnapshot> {
        let (tx, rx) = watch::channel(FleetSnapshot {
            desired: instances.len() as u32,
            instances,
        });
        // Keep the sender alive for the test's duration.
        std::mem::forget(tx);
        rx
    }

    fn instance(id: &str, ip: Ipv4Addr, state: LifecycleState, started_at: u64) -> InstanceSnapshot {
        InstanceSnapshot {
            id: id.to_string(),
            ip_address: ip,
            lifecycle_state: state,
            consecutive_failures: 0,
            started_at,
        }
    }

    #[tokio::test]
    async fn unreachable_instance_crosses_threshold_and_requests_replacement() {
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let snapshot_rx = snapshot_with(vec![instance(
            "vsd-dead",
            Ipv4Addr::LOCALHOST,
            LifecycleState::Running,
            0,
        )]);
        // Port 1: closed, probes fail.
        let mut monitor = HealthMonitor::new(fast_config(2), 1, snapshot_rx, events_tx);

        monitor.probe_round().await.unwrap();
        let first = events_rx.recv().await.unwrap();
        assert_eq!(
            first,
            HealthEvent::Probe {
                id: "vsd-dead".to_string(),
                status: ProbeStatus::Unknown,
                consecutive_failures: 1,
            }
        );

        monitor.probe_round().await.unwrap();
        let second = events_rx.recv().await.unwrap();
        assert_eq!(
            second,
            HealthEvent::Probe {
                id: "vsd-dead".to_string(),
                status: ProbeStatus::Unhealthy,
                consecutive_failures: 2,
            }
        );
        let replace = events_rx.recv().await.unwrap();
        assert_eq!(
            replace,
            HealthEvent::Replace {
                id: "vsd-dead".to_string()
            }
        );

        // Third round: still unhealthy, but no second Replace from the
        // monitor (no new crossing).
        monitor.probe_round().await.unwrap();
        let third = events_rx.recv().await.unwrap();
        assert!(matches!(third, HealthEvent::Probe { .. }));
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reachable_instance_reports_healthy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let (events_tx, mut events_rx) = mpsc::channel(64);
        let snapshot_rx = snapshot_with(vec![instance(
            "vsd-live",
            Ipv4Addr::LOCALHOST,
            LifecycleState::Running,
            0,
        )]);
        let mut monitor = HealthMonitor::new(fast_config(3), port, snapshot_rx, events_tx);

        monitor.probe_round().await.unwrap();
        let event = events_rx.recv().await.unwrap();
        assert_eq!(
            event,
            HealthEvent::Probe {
                id: "vsd-live".to_string(),
                status: ProbeStatus::Healthy,
                consecutive_failures: 0,
            }
        );
    }

    #[tokio::test]
    async fn instances_inside_start_delay_are_not_probed() {
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let mut config = fast_config(2);
        config.start_delay_secs = 3600;
        let now = epoch_secs();
        let snapshot_rx = snapshot_with(vec![instance(
            "vsd-booting",
            Ipv4Addr::LOCALHOST,
            LifecycleState::Running,
            now,
        )]);
        let mut monitor = HealthMonitor::new(config, 1, snapshot_rx, events_tx);

        monitor.probe_round().await.unwrap();
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminating_instances_are_not_probed() {
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let snapshot_rx = snapshot_with(vec![
            instance(
                "vsd-gone",
                Ipv4Addr::LOCALHOST,
                LifecycleState::Terminating,
                0,
            ),
            instance(
                "vsd-new",
                Ipv4Addr::LOCALHOST,
                LifecycleState::Provisioning,
                0,
            ),
        ]);
        let mut monitor = HealthMonitor::new(fast_config(2), 1, snapshot_rx, events_tx);

        monitor.probe_round().await.unwrap();
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn trackers_are_pruned_with_the_fleet() {
        let (events_tx, _events_rx) = mpsc::channel(64);
        let (snap_tx, snap_rx) = watch::channel(FleetSnapshot {
            desired: 1,
            instances: vec![instance(
                "vsd-a",
                Ipv4Addr::LOCALHOST,
                LifecycleState::Running,
                0,
            )],
        });
        let mut monitor = HealthMonitor::new(fast_config(5), 1, snap_rx, events_tx);

        monitor.probe_round().await.unwrap();
        assert_eq!(monitor.trackers.len(), 1);

        snap_tx
            .send(FleetSnapshot {
                desired: 0,
                instances: vec![],
            })
            .unwrap();
        monitor.probe_round().await.unwrap();
        assert!(monitor.trackers.is_empty());
    }
}

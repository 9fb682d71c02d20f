//! The reconciliation loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use virtscale_fleet::{
    FleetSnapshot, Instance, InstanceId, InstanceSnapshot, LifecycleState, ScalerConfig,
};
use virtscale_health::{HealthEvent, ProbeStatus};
use virtscale_hypervisor::Hypervisor;
use virtscale_net::NetworkProvisioner;
use virtscale_provision::DomainProvisioner;

use crate::command::{Command, ScalerError, ScalerHandle};

/// Depth of the command queue. Commands are tiny and drained every pass.
const COMMAND_QUEUE_DEPTH: usize = 32;
/// Depth of the health event queue; bounds a flapping monitor.
const EVENT_QUEUE_DEPTH: usize = 256;

/// The control loop. Exclusive owner of the fleet map; everything else
/// sees the fleet through published snapshots.
pub struct Reconciler<H> {
    hv: Arc<H>,
    provisioner: Arc<DomainProvisioner<H>>,
    network: NetworkProvisioner,
    config: ScalerConfig,

    fleet: HashMap<InstanceId, Instance>,
    desired: u32,
    /// Instances flagged for replacement, deduplicated across passes.
    pending_replacements: HashSet<InstanceId>,
    stop_requested: bool,

    cmd_rx: mpsc::Receiver<Command>,
    event_rx: mpsc::Receiver<HealthEvent>,
    events_closed: bool,
    snapshot_tx: watch::Sender<FleetSnapshot>,
}

impl<H: Hypervisor> Reconciler<H> {
    /// Build a reconciler plus its control handle and the sender the
    /// health monitor reports through.
    pub fn new(
        hv: Arc<H>,
        provisioner: Arc<DomainProvisioner<H>>,
        network: NetworkProvisioner,
        config: ScalerConfig,
    ) -> (Self, ScalerHandle, mpsc::Sender<HealthEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (snapshot_tx, snapshot_rx) = watch::channel(FleetSnapshot::default());

        let desired = config.initial_replicas;
        let reconciler = Self {
            hv,
            provisioner,
            network,
            config,
            fleet: HashMap::new(),
            desired,
            pending_replacements: HashSet::new(),
            stop_requested: false,
            cmd_rx,
            event_rx,
            events_closed: false,
            snapshot_tx,
        };
        let handle = ScalerHandle {
            cmd_tx,
            snapshot_rx,
        };
        (reconciler, handle, event_tx)
    }

    /// Rebuild the fleet from the hypervisor's live domain list.
    ///
    /// Only domains matching the daemon's naming convention are adopted;
    /// nothing else on the host is touched. A listing failure is fatal —
    /// the daemon cannot run without knowing what it owns.
    pub async fn adopt_existing(&mut self) -> Result<usize, ScalerError> {
        let prefix = self.provisioner.domain_prefix();
        let names = self.hv.list_domains(&prefix).await?;
        for name in names {
            match self.provisioner.adopt(&name) {
                Ok(instance) => {
                    self.fleet.insert(instance.id.clone(), instance);
                }
                Err(e) => {
                    error!(id = %name, error = %e, "failed to adopt existing domain");
                }
            }
        }
        let count = self.fleet.len();
        if count > 0 {
            info!(count, "rebuilt fleet from live domains");
        }
        self.publish();
        Ok(count)
    }

    /// Run reconciliation passes until a stop is requested, then drain the
    /// fleet and tear down the network.
    pub async fn run(mut self) {
        info!(
            desired = self.desired,
            pass_interval_secs = self.config.pass_interval_secs,
            "reconciler started"
        );
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.pass_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.apply_command(cmd),
                    // Every handle dropped: nobody can stop us later, so
                    // treat it as a stop request.
                    None => self.stop_requested = true,
                },
                event = self.event_rx.recv(), if !self.events_closed => match event {
                    Some(event) => self.apply_event(event),
                    None => self.events_closed = true,
                },
            }

            self.drain_inputs();
            if self.stop_requested {
                break;
            }
            self.pass().await;
        }

        self.shutdown().await;
    }

    // ── Input handling ─────────────────────────────────────────────

    /// Drain everything already queued. Later-arriving input waits for the
    /// next pass, so a pass always acts on one consistent view.
    fn drain_inputs(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            self.apply_command(cmd);
        }
        while let Ok(event) = self.event_rx.try_recv() {
            self.apply_event(event);
        }
    }

    fn apply_command(&mut self, cmd: Command) {
        match cmd {
            Command::Scale(count) => {
                if self.desired != count {
                    info!(from = self.desired, to = count, "desired count changed");
                }
                self.desired = count;
            }
            Command::Stop => {
                info!("stop requested");
                self.stop_requested = true;
            }
        }
    }

    fn apply_event(&mut self, event: HealthEvent) {
        match event {
            HealthEvent::Probe {
                id,
                status,
                consecutive_failures,
            } => {
                let Some(instance) = self.fleet.get_mut(&id) else {
                    return;
                };
                instance.consecutive_failures = consecutive_failures;
                let target = match status {
                    ProbeStatus::Healthy => LifecycleState::Healthy,
                    ProbeStatus::Unhealthy => LifecycleState::Unhealthy,
                    ProbeStatus::Unknown => return,
                };
                if instance.lifecycle_state != target
                    && instance.lifecycle_state.can_transition(target)
                {
                    info!(id = %id, from = ?instance.lifecycle_state, to = ?target, "health transition");
                    instance.lifecycle_state = target;
                }
            }
            HealthEvent::Replace { id } => {
                let eligible = self
                    .fleet
                    .get(&id)
                    .is_some_and(|i| i.lifecycle_state.is_active());
                if eligible && self.pending_replacements.insert(id.clone()) {
                    warn!(id = %id, "replacement requested");
                }
            }
        }
    }

    // ── The pass ───────────────────────────────────────────────────

    /// One reconciliation pass: bounded progress towards the desired
    /// count. Inputs must already be drained.
    async fn pass(&mut self) {
        self.retry_terminating().await;

        let active = self
            .fleet
            .values()
            .filter(|i| i.lifecycle_state.is_active())
            .count() as i64;
        let delta = i64::from(self.desired) - active;

        if delta > 0 {
            self.scale_up(delta as usize).await;
        } else if delta < 0 {
            self.scale_down((-delta) as usize).await;
        }

        self.process_replacements().await;
        self.publish();
    }

    /// Re-attempt destruction of instances stuck in `Terminating` from an
    /// earlier failed destroy.
    async fn retry_terminating(&mut self) {
        let stuck: Vec<Instance> = self
            .fleet
            .values()
            .filter(|i| i.lifecycle_state == LifecycleState::Terminating)
            .cloned()
            .collect();
        for instance in stuck {
            match self.provisioner.destroy(&instance).await {
                Ok(()) => {
                    self.fleet.remove(&instance.id);
                }
                Err(e) => {
                    warn!(id = %instance.id, error = %e, "destroy retry failed; will retry next pass");
                }
            }
        }
    }

    async fn scale_up(&mut self, count: usize) {
        info!(count, desired = self.desired, "provisioning instances");
        let attempts: Vec<_> = (0..count).map(|_| self.provisioner.provision()).collect();
        let results = futures::future::join_all(attempts).await;
        for result in results {
            match result {
                Ok(instance) => {
                    self.fleet.insert(instance.id.clone(), instance);
                }
                Err(e) => {
                    // One failed provision never blocks the rest; the
                    // shortfall shows up in the next pass's delta.
                    error!(error = %e, "provisioning failed; will retry next pass");
                }
            }
        }
    }

    async fn scale_down(&mut self, count: usize) {
        info!(count, desired = self.desired, "terminating surplus instances");
        let mut candidates: Vec<&Instance> = self
            .fleet
            .values()
            .filter(|i| i.lifecycle_state.is_active())
            .collect();
        // Unhealthy instances go first, then the oldest; the id breaks
        // ties deterministically.
        candidates.sort_by(|a, b| {
            termination_rank(a.lifecycle_state)
                .cmp(&termination_rank(b.lifecycle_state))
                .then(a.started_at.cmp(&b.started_at))
                .then(a.id.cmp(&b.id))
        });
        let victims: Vec<InstanceId> = candidates
            .into_iter()
            .take(count)
            .map(|i| i.id.clone())
            .collect();

        for id in victims {
            self.terminate(&id).await;
        }
    }

    /// Destroy the instances flagged by the health monitor. Their loss is
    /// compensated by the *next* pass's delta, so a systemic provisioning
    /// failure is never compounded within the same pass.
    async fn process_replacements(&mut self) {
        let pending: Vec<InstanceId> = self.pending_replacements.drain().collect();
        for id in pending {
            let eligible = self
                .fleet
                .get(&id)
                .is_some_and(|i| i.lifecycle_state.is_active());
            if eligible {
                warn!(id = %id, "replacing unhealthy instance");
                self.terminate(&id).await;
            }
        }
    }

    /// Move one instance to `Terminating` and attempt destruction. On
    /// failure the instance stays in the fleet and is retried next pass.
    async fn terminate(&mut self, id: &str) {
        let Some(instance) = self.fleet.get_mut(id) else {
            return;
        };
        if instance.lifecycle_state == LifecycleState::Terminating {
            return;
        }
        instance.lifecycle_state = LifecycleState::Terminating;
        let copy = instance.clone();

        match self.provisioner.destroy(&copy).await {
            Ok(()) => {
                self.fleet.remove(id);
                debug!(id = %id, "instance terminated");
            }
            Err(e) => {
                warn!(id = %id, error = %e, "destroy failed; instance stays terminating");
            }
        }
    }

    fn publish(&self) {
        let mut instances: Vec<InstanceSnapshot> = self.fleet.values().map(Into::into).collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        self.snapshot_tx.send_replace(FleetSnapshot {
            desired: self.desired,
            instances,
        });
    }

    // ── Shutdown ───────────────────────────────────────────────────

    /// Best-effort teardown of everything the daemon owns, bounded by the
    /// configured overall timeout. Individual failures are logged and do
    /// not stop the rest of the sequence.
    async fn shutdown(&mut self) {
        info!(instances = self.fleet.len(), "shutting down: draining fleet");
        for instance in self.fleet.values_mut() {
            instance.lifecycle_state = LifecycleState::Terminating;
        }
        self.publish();

        let deadline = Duration::from_secs(self.config.shutdown_timeout_secs);
        let cleanup = async {
            let instances: Vec<Instance> = self.fleet.values().cloned().collect();
            for instance in instances {
                if let Err(e) = self.provisioner.destroy(&instance).await {
                    error!(id = %instance.id, error = %e, "shutdown: destroy failed");
                }
                // The fleet dies with the process either way.
                self.fleet.remove(&instance.id);
            }
            if let Err(e) = self.network.teardown(self.hv.as_ref()).await {
                error!(error = %e, "shutdown: network teardown failed");
            }
        };
        if tokio::time::timeout(deadline, cleanup).await.is_err() {
            warn!(
                timeout_secs = self.config.shutdown_timeout_secs,
                "shutdown timed out before cleanup finished"
            );
        }

        self.fleet.clear();
        self.publish();
        info!("reconciler stopped");
    }
}

/// Scale-down preference: unhealthy instances are always chosen before
/// healthy ones.
fn termination_rank(state: LifecycleState) -> u8 {
    match state {
        LifecycleState::Unhealthy => 0,
        _ => 1,
    }
}

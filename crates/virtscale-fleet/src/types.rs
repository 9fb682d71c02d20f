//! Domain types for the managed VM fleet.
//!
//! An `Instance` is one managed virtual machine together with the metadata
//! the daemon needs to converge, probe, and tear it down. The reconciler is
//! the single writer of instance state; every other component sees the fleet
//! through immutable `FleetSnapshot`s.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Unique identifier for a managed instance. Doubles as the hypervisor
/// domain name and the disk-volume name stem.
pub type InstanceId = String;

// ── Lifecycle ─────────────────────────────────────────────────────

/// Lifecycle state of a managed instance.
///
/// Transitions are monotonic except for the `Healthy ⇄ Unhealthy` cycle:
/// no instance re-enters `Provisioning` after leaving it, and `Terminating`
/// is absorbing (an instance only leaves it by being destroyed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Provisioning,
    Running,
    Healthy,
    Unhealthy,
    Terminating,
    Terminated,
}

impl LifecycleState {
    /// Whether a transition from `self` to `to` is legal.
    ///
    /// Any state may move to `Terminating` (scale-down, replacement, or an
    /// externally observed disappearance).
    pub fn can_transition(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, to) {
            (_, Terminating) => self != Terminated,
            (Provisioning, Running) => true,
            (Running, Healthy) | (Running, Unhealthy) => true,
            (Healthy, Unhealthy) | (Unhealthy, Healthy) => true,
            (Terminating, Terminated) => true,
            _ => false,
        }
    }

    /// States counted towards the desired replica count.
    pub fn is_active(self) -> bool {
        !matches!(self, LifecycleState::Terminating | LifecycleState::Terminated)
    }

    /// States eligible for health probing.
    pub fn is_probeable(self) -> bool {
        matches!(
            self,
            LifecycleState::Running | LifecycleState::Healthy | LifecycleState::Unhealthy
        )
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Handle to the ephemeral disk volume owned by an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    /// Storage pool the volume lives in.
    pub pool: String,
    /// Volume name within the pool.
    pub name: String,
}

/// One managed virtual machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Stable identifier; immutable once created.
    pub id: InstanceId,
    /// Address assigned at provisioning time, held for the instance's
    /// lifetime. Never shared with another live instance.
    pub ip_address: Ipv4Addr,
    pub lifecycle_state: LifecycleState,
    /// Name of the shared NAT network (referenced, not owned).
    pub network_ref: String,
    /// The instance's exclusively-owned disk volume.
    pub disk_ref: VolumeRef,
    /// Consecutive failed probes; reset to 0 on any success.
    pub consecutive_failures: u32,
    /// Unix timestamp (seconds) when the instance was provisioned or
    /// adopted. Drives oldest-first scale-down and the probe grace period.
    pub started_at: u64,
}

// ── Snapshots ─────────────────────────────────────────────────────

/// Read-only view of one instance, as published to the control surface
/// and the health monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub ip_address: Ipv4Addr,
    pub lifecycle_state: LifecycleState,
    pub consecutive_failures: u32,
    pub started_at: u64,
}

impl From<&Instance> for InstanceSnapshot {
    fn from(inst: &Instance) -> Self {
        Self {
            id: inst.id.clone(),
            ip_address: inst.ip_address,
            lifecycle_state: inst.lifecycle_state,
            consecutive_failures: inst.consecutive_failures,
            started_at: inst.started_at,
        }
    }
}

/// Point-in-time view of the whole fleet plus the current target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    /// Operator-specified target replica count.
    pub desired: u32,
    pub instances: Vec<InstanceSnapshot>,
}

impl FleetSnapshot {
    /// Number of instances counted against the desired count.
    pub fn active_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.lifecycle_state.is_active())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_is_never_reentered() {
        use LifecycleState::*;
        for state in [Running, Healthy, Unhealthy, Terminating, Terminated] {
            assert!(!state.can_transition(Provisioning));
        }
    }

    #[test]
    fn health_cycle_is_bidirectional() {
        assert!(LifecycleState::Healthy.can_transition(LifecycleState::Unhealthy));
        assert!(LifecycleState::Unhealthy.can_transition(LifecycleState::Healthy));
    }

    #[test]
    fn any_live_state_may_terminate() {
        use LifecycleState::*;
        for state in [Provisioning, Running, Healthy, Unhealthy, Terminating] {
            assert!(state.can_transition(Terminating));
        }
        assert!(!Terminated.can_transition(Terminating));
    }

    #[test]
    fn terminating_only_leads_to_terminated() {
        use LifecycleState::*;
        assert!(Terminating.can_transition(Terminated));
        for state in [Provisioning, Running, Healthy, Unhealthy] {
            assert!(!Terminating.can_transition(state));
        }
    }

    #[test]
    fn active_and_probeable_sets() {
        use LifecycleState::*;
        assert!(Provisioning.is_active());
        assert!(!Terminating.is_active());
        assert!(!Provisioning.is_probeable());
        assert!(Running.is_probeable());
        assert!(Unhealthy.is_probeable());
        assert!(!Terminating.is_probeable());
    }

    #[test]
    fn snapshot_active_count_excludes_terminating() {
        let inst = |id: &str, state| InstanceSnapshot {
            id: id.to_string(),
            ip_address: Ipv4Addr::new(192, 168, 100, 2),
            lifecycle_state: state,
            consecutive_failures: 0,
            started_at: 1000,
        };
        let snap = FleetSnapshot {
            desired: 2,
            instances: vec![
                inst("a", LifecycleState::Healthy),
                inst("b", LifecycleState::Terminating),
                inst("c", LifecycleState::Provisioning),
            ],
        };
        assert_eq!(snap.active_count(), 2);
    }

    #[test]
    fn lifecycle_state_serializes_snake_case() {
        let json = serde_json::to_string(&LifecycleState::Provisioning).unwrap();
        assert_eq!(json, "\"provisioning\"");
    }
}

//! Commands and the control-surface handle.

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use virtscale_fleet::FleetSnapshot;
use virtscale_hypervisor::HypervisorError;

/// Commands accepted by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Set the desired replica count. Within one pass the newest wins.
    Scale(u32),
    /// Drain the fleet, tear down the network, and exit the loop.
    Stop,
}

/// Errors surfaced by the scaler boundary.
#[derive(Debug, Error)]
pub enum ScalerError {
    #[error("reconciler is not running")]
    Stopped,

    #[error("failed to rebuild fleet from hypervisor: {0}")]
    Adopt(#[from] HypervisorError),
}

/// Cheap cloneable handle to the reconciler, used by the control surface.
///
/// Commands only enqueue; reads only look at the latest published
/// snapshot. Neither touches fleet state, so both are safe while the
/// loop is mid-pass.
#[derive(Debug, Clone)]
pub struct ScalerHandle {
    pub(crate) cmd_tx: mpsc::Sender<Command>,
    pub(crate) snapshot_rx: watch::Receiver<FleetSnapshot>,
}

impl ScalerHandle {
    /// Enqueue a new desired replica count.
    pub async fn scale(&self, count: u32) -> Result<(), ScalerError> {
        self.cmd_tx
            .send(Command::Scale(count))
            .await
            .map_err(|_| ScalerError::Stopped)
    }

    /// Enqueue a shutdown request.
    pub async fn stop(&self) -> Result<(), ScalerError> {
        self.cmd_tx
            .send(Command::Stop)
            .await
            .map_err(|_| ScalerError::Stopped)
    }

    /// The most recently published fleet snapshot.
    pub fn snapshot(&self) -> FleetSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Subscribe to snapshot updates (used by the health monitor).
    pub fn subscribe(&self) -> watch::Receiver<FleetSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Wait until the published snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<FleetSnapshot, ScalerError>
    where
        F: FnMut(&FleetSnapshot) -> bool,
    {
        let mut rx = self.snapshot_rx.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if predicate(&current) {
                    return Ok(current.clone());
                }
            }
            rx.changed().await.map_err(|_| ScalerError::Stopped)?;
        }
    }
}

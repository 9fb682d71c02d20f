//! virtscale-scaler — the reconciliation engine.
//!
//! The [`Reconciler`] is the single writer of fleet state. It owns the
//! instance map and the desired replica count, drains a command queue
//! (scale, stop) and the health monitor's event queue, and converges the
//! fleet one bounded pass at a time:
//!
//! ```text
//! ScalerHandle ──commands──▶ ┌────────────┐ ──provision/destroy──▶ hypervisor
//! HealthMonitor ──events──▶  │ Reconciler │
//!                            └────────────┘ ──FleetSnapshot (watch)──▶ readers
//! ```
//!
//! Convergence is eventual: one instance's failed provision or destroy is
//! logged and retried on a later pass, never aborting the loop or touching
//! unrelated instances.

pub mod command;
pub mod reconciler;

pub use command::{Command, ScalerError, ScalerHandle};
pub use reconciler::Reconciler;

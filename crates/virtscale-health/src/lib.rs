//! virtscale-health — health monitoring for the managed fleet.
//!
//! The monitor probes every `Running`/`Healthy`/`Unhealthy` instance on a
//! fixed interval with a bounded-timeout TCP connect, tracks consecutive
//! outcomes per instance, and reports through a bounded channel:
//!
//! ```text
//! HealthMonitor
//!   ├── FleetSnapshot (watch, read-only)
//!   ├── tcp_probe() per instance, concurrency-capped
//!   ├── HealthTracker per instance (consecutive failures/successes)
//!   └── HealthEvent → reconciler (mpsc, bounded)
//! ```
//!
//! The monitor never provisions or destroys anything; crossing the failure
//! threshold only emits a `Replace` event. All fleet mutation stays with
//! the reconciler.

pub mod monitor;
pub mod probe;
pub mod tracker;

pub use monitor::{HealthEvent, HealthMonitor};
pub use probe::{tcp_probe, ProbeResult};
pub use tracker::{HealthTracker, ProbeStatus};

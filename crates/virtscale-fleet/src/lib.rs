//! virtscale-fleet — core domain types for the virtscale daemon.
//!
//! Defines the `Instance` model and its lifecycle state machine, the
//! snapshot types published by the reconciler, and the typed daemon
//! configuration loaded from TOML.
//!
//! The fleet itself is process-lifetime state: it is owned exclusively by
//! the reconciler and rebuilt from the hypervisor's live domain list on
//! every daemon start. Nothing in this crate persists.

pub mod config;
pub mod types;

pub use config::*;
pub use types::*;

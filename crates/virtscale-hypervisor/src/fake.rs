//! In-memory hypervisor double for tests.
//!
//! Tracks networks, volumes, and domain definitions the way the real
//! hypervisor would, and supports injecting failures for specific
//! operations so callers can exercise their partial-failure paths.

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::HypervisorError;
use crate::{Hypervisor, HvResult};

#[derive(Debug, Default)]
struct FakeState {
    networks: BTreeSet<String>,
    /// Keys of the form `pool/name`.
    volumes: BTreeSet<String>,
    defined: BTreeSet<String>,
    running: BTreeSet<String>,
    fail_ping: bool,
    fail_define_network: bool,
    fail_create_volume: u32,
    fail_define_domain: u32,
    fail_start_domain: u32,
    fail_destroy_domain: u32,
}

/// A hypervisor that exists only in memory.
#[derive(Debug, Default)]
pub struct FakeHypervisor {
    state: Mutex<FakeState>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Failure injection ──────────────────────────────────────────

    pub fn fail_ping(&self) {
        self.lock().fail_ping = true;
    }

    pub fn fail_define_network(&self) {
        self.lock().fail_define_network = true;
    }

    /// Make the next `n` volume creations fail.
    pub fn fail_create_volume(&self, n: u32) {
        self.lock().fail_create_volume = n;
    }

    /// Make the next `n` domain definitions fail.
    pub fn fail_define_domain(&self, n: u32) {
        self.lock().fail_define_domain = n;
    }

    /// Make the next `n` domain starts fail.
    pub fn fail_start_domain(&self, n: u32) {
        self.lock().fail_start_domain = n;
    }

    /// Make the next `n` domain destroys fail (with a retryable error,
    /// not a not-found).
    pub fn fail_destroy_domain(&self, n: u32) {
        self.lock().fail_destroy_domain = n;
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub fn has_network(&self, name: &str) -> bool {
        self.lock().networks.contains(name)
    }

    pub fn running_domains(&self) -> Vec<String> {
        self.lock().running.iter().cloned().collect()
    }

    pub fn defined_domains(&self) -> Vec<String> {
        self.lock().defined.iter().cloned().collect()
    }

    pub fn volume_keys(&self) -> Vec<String> {
        self.lock().volumes.iter().cloned().collect()
    }

    /// Pre-seed a running domain, as if it survived a previous daemon run.
    pub fn seed_domain(&self, name: &str) {
        let mut state = self.lock();
        state.defined.insert(name.to_string());
        state.running.insert(name.to_string());
    }

    fn take(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

/// Pull the `<name>` element out of an XML descriptor.
fn xml_name(xml: &str) -> Option<&str> {
    let start = xml.find("<name>")? + "<name>".len();
    let end = xml[start..].find("</name>")? + start;
    Some(xml[start..end].trim())
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn ping(&self) -> HvResult<()> {
        if self.lock().fail_ping {
            return Err(HypervisorError::Connection("fake: unreachable".into()));
        }
        Ok(())
    }

    async fn define_network(&self, xml: &str) -> HvResult<()> {
        let name = xml_name(xml)
            .ok_or_else(|| HypervisorError::CommandFailed {
                op: "net-create",
                detail: "descriptor has no <name>".into(),
            })?
            .to_string();
        let mut state = self.lock();
        if state.fail_define_network {
            return Err(HypervisorError::CommandFailed {
                op: "net-create",
                detail: "fake: injected network failure".into(),
            });
        }
        state.networks.insert(name);
        Ok(())
    }

    async fn network_exists(&self, name: &str) -> HvResult<bool> {
        Ok(self.lock().networks.contains(name))
    }

    async fn destroy_network(&self, name: &str) -> HvResult<()> {
        if !self.lock().networks.remove(name) {
            return Err(HypervisorError::NotFound(format!("network {name}")));
        }
        Ok(())
    }

    async fn create_volume(&self, pool: &str, name: &str, _capacity_bytes: u64) -> HvResult<()> {
        let mut state = self.lock();
        if Self::take(&mut state.fail_create_volume) {
            return Err(HypervisorError::CommandFailed {
                op: "vol-create-as",
                detail: "fake: injected volume failure".into(),
            });
        }
        state.volumes.insert(format!("{pool}/{name}"));
        Ok(())
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> HvResult<()> {
        if !self.lock().volumes.remove(&format!("{pool}/{name}")) {
            return Err(HypervisorError::NotFound(format!("volume {pool}/{name}")));
        }
        Ok(())
    }

    async fn define_domain(&self, xml: &str) -> HvResult<()> {
        let name = xml_name(xml)
            .ok_or_else(|| HypervisorError::CommandFailed {
                op: "define",
                detail: "descriptor has no <name>".into(),
            })?
            .to_string();
        let mut state = self.lock();
        if Self::take(&mut state.fail_define_domain) {
            return Err(HypervisorError::CommandFailed {
                op: "define",
                detail: "fake: injected define failure".into(),
            });
        }
        state.defined.insert(name);
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> HvResult<()> {
        let mut state = self.lock();
        if !state.defined.contains(name) {
            return Err(HypervisorError::NotFound(format!("domain {name}")));
        }
        if Self::take(&mut state.fail_start_domain) {
            return Err(HypervisorError::CommandFailed {
                op: "start",
                detail: "fake: injected start failure".into(),
            });
        }
        state.running.insert(name.to_string());
        Ok(())
    }

    async fn destroy_domain(&self, name: &str) -> HvResult<()> {
        let mut state = self.lock();
        if Self::take(&mut state.fail_destroy_domain) {
            return Err(HypervisorError::CommandFailed {
                op: "destroy",
                detail: "fake: injected destroy failure".into(),
            });
        }
        if !state.running.remove(name) {
            return Err(HypervisorError::NotFound(format!("domain {name}")));
        }
        Ok(())
    }

    async fn undefine_domain(&self, name: &str) -> HvResult<()> {
        if !self.lock().defined.remove(name) {
            return Err(HypervisorError::NotFound(format!("domain {name}")));
        }
        Ok(())
    }

    async fn list_domains(&self, name_prefix: &str) -> HvResult<Vec<String>> {
        Ok(self
            .lock()
            .defined
            .iter()
            .filter(|name| name.starts_with(name_prefix))
            .cloned()
            .collect())
    }
}

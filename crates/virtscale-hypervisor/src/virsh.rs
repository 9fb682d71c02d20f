//! `virsh`-backed hypervisor transport.
//!
//! Every operation shells out to `virsh --connect <uri>` via
//! `tokio::process`, so no call ever blocks the runtime and each operation
//! gets its own libvirt connection. XML descriptors are handed over through
//! a temporary file, the way `virsh net-create`/`define` expect them.

use async_trait::async_trait;
use std::io::Write;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::HypervisorError;
use crate::{Hypervisor, HvResult};

/// Hypervisor access through the `virsh` command-line client.
pub struct VirshHypervisor {
    uri: String,
}

/// Stderr fragments that mean the target object was already gone (or, for
/// stop-like operations, already stopped). Libvirt wording varies between
/// object kinds and versions, so match loosely.
const NOT_FOUND_MARKERS: &[&str] = &[
    "not found",
    "no domain with matching",
    "no network with matching",
    "no storage vol with matching",
    "domain is not running",
    "network is not active",
];

impl VirshHypervisor {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    /// Run one virsh subcommand and capture its output.
    async fn run(&self, op: &'static str, args: &[&str]) -> HvResult<String> {
        trace!(%op, ?args, "running virsh");
        let output = Command::new("virsh")
            .arg("--connect")
            .arg(&self.uri)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!(%op, %stderr, "virsh reported failure");
        Err(classify(op, stderr))
    }

    /// Run a virsh subcommand that takes an XML descriptor file.
    async fn run_with_xml(&self, op: &'static str, subcommand: &str, xml: &str) -> HvResult<String> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(xml.as_bytes())?;
        file.flush()?;
        let path = file.path().to_string_lossy().into_owned();
        self.run(op, &[subcommand, &path]).await
    }
}

/// Map a virsh failure to the error taxonomy.
fn classify(op: &'static str, stderr: String) -> HypervisorError {
    let lowered = stderr.to_lowercase();
    if NOT_FOUND_MARKERS.iter().any(|m| lowered.contains(m)) {
        return HypervisorError::NotFound(stderr);
    }
    if lowered.contains("failed to connect") || lowered.contains("unable to connect") {
        return HypervisorError::Connection(stderr);
    }
    HypervisorError::CommandFailed { op, detail: stderr }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn ping(&self) -> HvResult<()> {
        match self.run("version", &["version"]).await {
            Ok(_) => Ok(()),
            Err(HypervisorError::CommandFailed { detail, .. }) => {
                Err(HypervisorError::Connection(detail))
            }
            Err(e) => Err(e),
        }
    }

    async fn define_network(&self, xml: &str) -> HvResult<()> {
        // net-create both defines and activates a transient network, which
        // matches the network's lifetime: it belongs to the daemon process.
        self.run_with_xml("net-create", "net-create", xml).await?;
        Ok(())
    }

    async fn network_exists(&self, name: &str) -> HvResult<bool> {
        match self.run("net-info", &["net-info", name]).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn destroy_network(&self, name: &str) -> HvResult<()> {
        self.run("net-destroy", &["net-destroy", name]).await?;
        Ok(())
    }

    async fn create_volume(&self, pool: &str, name: &str, capacity_bytes: u64) -> HvResult<()> {
        let capacity = format!("{capacity_bytes}b");
        self.run(
            "vol-create-as",
            &[
                "vol-create-as",
                pool,
                name,
                &capacity,
                "--format",
                "qcow2",
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> HvResult<()> {
        self.run("vol-delete", &["vol-delete", name, "--pool", pool])
            .await?;
        Ok(())
    }

    async fn define_domain(&self, xml: &str) -> HvResult<()> {
        self.run_with_xml("define", "define", xml).await?;
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> HvResult<()> {
        self.run("start", &["start", name]).await?;
        Ok(())
    }

    async fn destroy_domain(&self, name: &str) -> HvResult<()> {
        self.run("destroy", &["destroy", name]).await?;
        Ok(())
    }

    async fn undefine_domain(&self, name: &str) -> HvResult<()> {
        self.run("undefine", &["undefine", name]).await?;
        Ok(())
    }

    async fn list_domains(&self, name_prefix: &str) -> HvResult<Vec<String>> {
        let stdout = self.run("list", &["list", "--all", "--name"]).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && line.starts_with(name_prefix))
            .map(str::to_string)
            .collect())
    }
}

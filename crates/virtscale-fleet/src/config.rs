//! Daemon configuration.
//!
//! Loaded from a TOML file; every field has a default so a minimal config
//! only needs the boot ISO path:
//!
//! ```toml
//! [instance]
//! iso_path = "/var/lib/virtscale/boot.iso"
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for process-lifecycle artifacts: the pidfile and the
    /// per-instance guest artifacts. Not a fleet store.
    pub workdir: PathBuf,
    /// Prefix for domain names, the network name, and the bridge name.
    /// Only domains carrying this prefix are ever adopted on startup.
    pub name_prefix: String,
    pub hypervisor: HypervisorConfig,
    pub control: ControlConfig,
    pub network: NetworkConfig,
    pub instance: InstanceConfig,
    pub health: HealthConfig,
    pub scaler: ScalerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("/var/lib/virtscale"),
            name_prefix: "vsd".to_string(),
            hypervisor: HypervisorConfig::default(),
            control: ControlConfig::default(),
            network: NetworkConfig::default(),
            instance: InstanceConfig::default(),
            health: HealthConfig::default(),
            scaler: ScalerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Libvirt connection URI.
    pub uri: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Loopback address the control API listens on.
    pub listen: SocketAddr,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7787".parse().unwrap_or_else(|_| unreachable!()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network address of the fixed /24 subnet all instances share.
    pub subnet: Ipv4Addr,
    /// Resolvers written into each instance's guest network artifact.
    /// DNS is not served by the NAT network itself.
    pub dns: Vec<Ipv4Addr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnet: Ipv4Addr::new(192, 168, 100, 0),
            dns: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub vcpus: u32,
    pub memory_kib: u64,
    /// Capacity of the ephemeral disk volume, in GiB.
    pub disk_capacity_gib: u64,
    /// Boot ISO attached read-only to every instance.
    pub iso_path: PathBuf,
    /// Storage pool the ephemeral volumes are created in.
    pub volume_pool: String,
    /// Guest port probed for TCP reachability.
    pub health_port: u16,
    /// HTTP health path written into the service-registration artifact.
    /// The daemon itself never speaks HTTP to the guest.
    pub health_path: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            vcpus: 1,
            memory_kib: 1024 * 1024,
            disk_capacity_gib: 8,
            iso_path: PathBuf::new(),
            volume_pool: "default".to_string(),
            health_port: 8080,
            health_path: "/health".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Fixed polling interval between probe rounds.
    pub interval_secs: u64,
    /// Per-attempt TCP connect timeout.
    pub timeout_ms: u64,
    /// Consecutive failures before an instance is marked unhealthy and
    /// scheduled for replacement.
    pub unhealthy_threshold: u32,
    /// Consecutive successes before an instance is marked healthy.
    pub healthy_threshold: u32,
    /// Grace period after provisioning during which the instance is not
    /// probed (guest boot time).
    pub start_delay_secs: u64,
    /// Cap on concurrent probe connections.
    pub probe_concurrency: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            timeout_ms: 1000,
            unhealthy_threshold: 3,
            healthy_threshold: 1,
            start_delay_secs: 1800,
            probe_concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    /// Interval between reconciliation passes (retries of pending work
    /// happen on this cadence; commands wake the loop immediately).
    pub pass_interval_secs: u64,
    /// Desired replica count the daemon starts with.
    pub initial_replicas: u32,
    /// Overall bound on the best-effort shutdown sequence.
    pub shutdown_timeout_secs: u64,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            pass_interval_secs: 5,
            initial_replicas: 2,
            shutdown_timeout_secs: 60,
        }
    }
}

impl Config {
    /// Load the configuration from a TOML file.
    ///
    /// Validation is separate: the control subcommands only need the
    /// workdir and listen address, so only the daemon itself calls
    /// [`Config::validate`] before starting.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name_prefix.is_empty() {
            return Err(ConfigError::Invalid("name_prefix must not be empty".into()));
        }
        if !self
            .name_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(ConfigError::Invalid(format!(
                "name_prefix {:?} must be alphanumeric (dashes allowed)",
                self.name_prefix
            )));
        }
        if self.instance.iso_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("instance.iso_path must be set".into()));
        }
        if self.instance.vcpus == 0 {
            return Err(ConfigError::Invalid("instance.vcpus must be >= 1".into()));
        }
        if self.health.unhealthy_threshold == 0 || self.health.healthy_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health thresholds must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Name of the shared NAT network.
    pub fn network_name(&self) -> String {
        format!("{}-net", self.name_prefix)
    }
}

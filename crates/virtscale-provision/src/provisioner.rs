//! The domain provisioner.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use virtscale_fleet::{Config, Instance, InstanceConfig, LifecycleState, VolumeRef};
use virtscale_hypervisor::Hypervisor;
use virtscale_net::{AddressAllocator, NetworkRef};

use crate::domain::DomainSpec;
use crate::error::{DestroyError, ProvisionError};

/// Static network configuration the guest applies at boot.
#[derive(Debug, Serialize)]
struct GuestNetConfig {
    /// CIDR form, e.g. `192.168.100.7/24`.
    address: String,
    gateway: Ipv4Addr,
    dns: Vec<Ipv4Addr>,
}

/// Registration descriptor for the service-discovery sidecar in the guest.
#[derive(Debug, Serialize)]
struct ServiceRegistration<'a> {
    id: &'a str,
    address: Ipv4Addr,
    port: u16,
    check_path: &'a str,
}

/// Provisions and destroys instances against the hypervisor.
///
/// Also the owner of the address-allocation table: addresses are taken
/// here at provision time and only returned once destruction is confirmed.
pub struct DomainProvisioner<H> {
    hv: Arc<H>,
    allocator: Mutex<AddressAllocator>,
    network: NetworkRef,
    instance: InstanceConfig,
    dns: Vec<Ipv4Addr>,
    name_prefix: String,
    workdir: PathBuf,
}

impl<H: Hypervisor> DomainProvisioner<H> {
    pub fn new(hv: Arc<H>, network: NetworkRef, config: &Config) -> Self {
        Self {
            hv,
            allocator: Mutex::new(AddressAllocator::new(config.network.subnet)),
            network,
            instance: config.instance.clone(),
            dns: config.network.dns.clone(),
            name_prefix: config.name_prefix.clone(),
            workdir: config.workdir.clone(),
        }
    }

    /// Prefix every managed domain name carries, including the separator.
    /// Listing domains by this prefix is the adoption criterion on startup.
    pub fn domain_prefix(&self) -> String {
        format!("{}-", self.name_prefix)
    }

    /// Addresses currently held by live instances.
    pub fn allocated_count(&self) -> usize {
        self.lock_allocator().allocated_count()
    }

    fn lock_allocator(&self) -> std::sync::MutexGuard<'_, AddressAllocator> {
        self.allocator.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mint_id(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.name_prefix, &suffix[..8])
    }

    /// Bring one new instance up.
    ///
    /// Sequence: allocate address → create volume → define domain → write
    /// guest artifacts → start. Every failure unwinds whatever already
    /// exists before surfacing, so the caller never sees an orphan.
    pub async fn provision(&self) -> Result<Instance, ProvisionError> {
        let id = self.mint_id();
        let ip = self.lock_allocator().allocate(&id)?;

        let volume = VolumeRef {
            pool: self.instance.volume_pool.clone(),
            name: format!("{id}.qcow2"),
        };

        let capacity_bytes = self.instance.disk_capacity_gib * 1024 * 1024 * 1024;
        if let Err(source) = self
            .hv
            .create_volume(&volume.pool, &volume.name, capacity_bytes)
            .await
        {
            self.lock_allocator().release(ip);
            return Err(ProvisionError::Hypervisor {
                id,
                stage: "create-volume",
                source,
            });
        }

        let spec = match DomainSpec::new(
            id.clone(),
            self.instance.vcpus,
            self.instance.memory_kib,
            volume.clone(),
            self.instance.iso_path.clone(),
            self.network.name.clone(),
        ) {
            Ok(spec) => spec,
            Err(e) => {
                self.unwind(&id, &volume, false, ip).await;
                return Err(e);
            }
        };

        if let Err(source) = self.hv.define_domain(&spec.render_xml()).await {
            self.unwind(&id, &volume, false, ip).await;
            return Err(ProvisionError::Hypervisor {
                id,
                stage: "define",
                source,
            });
        }

        let mut instance = Instance {
            id: id.clone(),
            ip_address: ip,
            lifecycle_state: LifecycleState::Provisioning,
            network_ref: self.network.name.clone(),
            disk_ref: volume.clone(),
            consecutive_failures: 0,
            started_at: epoch_secs(),
        };

        if let Err(source) = self.write_artifacts(&instance) {
            self.unwind(&id, &volume, true, ip).await;
            return Err(ProvisionError::Artifacts { id, source });
        }

        if let Err(source) = self.hv.start_domain(&id).await {
            self.unwind(&id, &volume, true, ip).await;
            return Err(ProvisionError::Hypervisor {
                id,
                stage: "start",
                source,
            });
        }

        instance.lifecycle_state = LifecycleState::Running;
        info!(
            id = %instance.id,
            ip = %instance.ip_address,
            volume = %instance.disk_ref.name,
            "instance provisioned"
        );
        Ok(instance)
    }

    /// Tear one instance down. Idempotent: calling it for an instance that
    /// is partially or fully gone succeeds. A genuine hypervisor failure
    /// surfaces as [`DestroyError`] and leaves the address held so the
    /// reconciler can retry.
    pub async fn destroy(&self, instance: &Instance) -> Result<(), DestroyError> {
        let id = &instance.id;

        absorb_missing(id, "destroy", self.hv.destroy_domain(id).await)?;
        absorb_missing(id, "undefine", self.hv.undefine_domain(id).await)?;
        absorb_missing(
            id,
            "delete-volume",
            self.hv
                .delete_volume(&instance.disk_ref.pool, &instance.disk_ref.name)
                .await,
        )?;

        self.remove_artifacts(id);
        self.lock_allocator().release(instance.ip_address);
        info!(id = %id, ip = %instance.ip_address, "instance destroyed");
        Ok(())
    }

    /// Rebuild an `Instance` for a live domain found on startup. The
    /// address comes out of the same deterministic allocation the domain
    /// got when it was first provisioned.
    pub fn adopt(&self, name: &str) -> Result<Instance, ProvisionError> {
        let ip = self.lock_allocator().allocate(name)?;
        info!(id = %name, ip = %ip, "adopted existing domain");
        Ok(Instance {
            id: name.to_string(),
            ip_address: ip,
            lifecycle_state: LifecycleState::Running,
            network_ref: self.network.name.clone(),
            disk_ref: VolumeRef {
                pool: self.instance.volume_pool.clone(),
                name: format!("{name}.qcow2"),
            },
            consecutive_failures: 0,
            started_at: epoch_secs(),
        })
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Roll back a partially provisioned instance. Best effort: cleanup
    /// failures are logged, not surfaced (the provision error is the one
    /// the caller needs to see).
    async fn unwind(&self, id: &str, volume: &VolumeRef, undefine: bool, ip: Ipv4Addr) {
        debug!(id = %id, "unwinding partial provision");
        if undefine {
            if let Err(e) = self.hv.undefine_domain(id).await {
                if !e.is_not_found() {
                    warn!(id = %id, error = %e, "failed to undefine during unwind");
                }
            }
        }
        if let Err(e) = self.hv.delete_volume(&volume.pool, &volume.name).await {
            if !e.is_not_found() {
                warn!(id = %id, error = %e, "failed to delete volume during unwind");
            }
        }
        self.remove_artifacts(id);
        self.lock_allocator().release(ip);
    }

    fn artifact_dir(&self, id: &str) -> PathBuf {
        self.workdir.join("instances").join(id)
    }

    /// Write the per-instance guest artifacts: the static network config
    /// the guest applies at boot, and the service-registration descriptor
    /// for its discovery sidecar. Responsibility ends at making these
    /// available; whether the guest applied them is the health monitor's
    /// signal to judge.
    fn write_artifacts(&self, instance: &Instance) -> std::io::Result<()> {
        let dir = self.artifact_dir(&instance.id);
        std::fs::create_dir_all(&dir)?;

        let netcfg = GuestNetConfig {
            address: format!("{}/24", instance.ip_address),
            gateway: self.network.gateway,
            dns: self.dns.clone(),
        };
        std::fs::write(
            dir.join("netcfg.json"),
            serde_json::to_vec_pretty(&netcfg)?,
        )?;

        let registration = ServiceRegistration {
            id: &instance.id,
            address: instance.ip_address,
            port: self.instance.health_port,
            check_path: &self.instance.health_path,
        };
        std::fs::write(
            dir.join("service.json"),
            serde_json::to_vec_pretty(&registration)?,
        )?;
        Ok(())
    }

    fn remove_artifacts(&self, id: &str) {
        let dir = self.artifact_dir(id);
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(id = %id, error = %e, "failed to remove guest artifacts");
            }
        }
    }
}

/// Treat "already gone" as success; report anything else as retryable.
fn absorb_missing(
    id: &str,
    stage: &'static str,
    result: Result<(), virtscale_hypervisor::HypervisorError>,
) -> Result<(), DestroyError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!(id = %id, stage, "already gone");
            Ok(())
        }
        Err(source) => {
            error!(id = %id, stage, error = %source, "destroy step failed");
            Err(DestroyError::Hypervisor {
                id: id.to_string(),
                stage,
                source,
            })
        }
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
    use virtscale_fleet::Config;
    use virtscale_hypervisor::FakeHypervisor;
    use virtscale_net::NetworkProvisioner;

    async fn test_provisioner(
        hv: Arc<FakeHypervisor>,
    ) -> (DomainProvisioner<FakeHypervisor>, tempfile::TempDir) {
        let workdir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.workdir = workdir.path().to_path_buf();
        config.instance.iso_path = "/srv/images/guest.iso".into();

        let network = NetworkProvisioner::new(config.network_name(), config.network.subnet)
            .ensure(hv.as_ref())
            .await
            .unwrap();
        (DomainProvisioner::new(hv, network, &config), workdir)
    }

    #[tokio::test]
    async fn provision_creates_volume_domain_and_artifacts() {
        let hv = Arc::new(FakeHypervisor::new());
        let (prov, workdir) = test_provisioner(Arc::clone(&hv)).await;

        let instance = prov.provision().await.unwrap();
        assert_eq!(instance.lifecycle_state, LifecycleState::Running);
        assert!(instance.id.starts_with("vsd-"));
        assert_eq!(hv.running_domains(), vec![instance.id.clone()]);
        assert_eq!(
            hv.volume_keys(),
            vec![format!("default/{}.qcow2", instance.id)]
        );

        let dir = workdir.path().join("instances").join(&instance.id);
        let netcfg: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join("netcfg.json")).unwrap()).unwrap();
        assert_eq!(
            netcfg["address"],
            serde_json::json!(format!("{}/24", instance.ip_address))
        );
        assert_eq!(netcfg["gateway"], serde_json::json!("192.168.100.1"));

        let service: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join("service.json")).unwrap()).unwrap();
        assert_eq!(service["id"], serde_json::json!(instance.id));
        assert_eq!(service["port"], serde_json::json!(8080));
    }

    #[tokio::test]
    async fn failed_start_leaves_no_orphans() {
        let hv = Arc::new(FakeHypervisor::new());
        let (prov, workdir) = test_provisioner(Arc::clone(&hv)).await;
        hv.fail_start_domain(1);

        let err = prov.provision().await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Hypervisor { stage: "start", .. }
        ));
        assert!(hv.running_domains().is_empty());
        assert!(hv.defined_domains().is_empty());
        assert!(hv.volume_keys().is_empty());
        assert_eq!(prov.allocated_count(), 0);
        // No stray artifact directories either.
        let instances_dir = workdir.path().join("instances");
        let leftover = std::fs::read_dir(&instances_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn failed_volume_releases_address() {
        let hv = Arc::new(FakeHypervisor::new());
        let (prov, _workdir) = test_provisioner(Arc::clone(&hv)).await;
        hv.fail_create_volume(1);

        let err = prov.provision().await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Hypervisor {
                stage: "create-volume",
                ..
            }
        ));
        assert_eq!(prov.allocated_count(), 0);

        // The next attempt goes through.
        prov.provision().await.unwrap();
        assert_eq!(prov.allocated_count(), 1);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let hv = Arc::new(FakeHypervisor::new());
        let (prov, _workdir) = test_provisioner(Arc::clone(&hv)).await;

        let instance = prov.provision().await.unwrap();
        prov.destroy(&instance).await.unwrap();
        // Second destroy hits only "already gone" paths.
        prov.destroy(&instance).await.unwrap();
        assert!(hv.running_domains().is_empty());
        assert!(hv.volume_keys().is_empty());
    }

    #[tokio::test]
    async fn failed_destroy_keeps_address_held() {
        let hv = Arc::new(FakeHypervisor::new());
        let (prov, _workdir) = test_provisioner(Arc::clone(&hv)).await;

        let instance = prov.provision().await.unwrap();
        hv.fail_destroy_domain(1);

        assert!(prov.destroy(&instance).await.is_err());
        assert_eq!(prov.allocated_count(), 1);

        // Retry succeeds and frees the address.
        prov.destroy(&instance).await.unwrap();
        assert_eq!(prov.allocated_count(), 0);
    }

    #[tokio::test]
    async fn adopt_rederives_the_deterministic_address() {
        let hv = Arc::new(FakeHypervisor::new());
        let (prov, _workdir) = test_provisioner(Arc::clone(&hv)).await;

        let instance = prov.provision().await.unwrap();
        let expected_ip = instance.ip_address;
        prov.destroy(&instance).await.unwrap();

        let adopted = prov.adopt(&instance.id).unwrap();
        assert_eq!(adopted.ip_address, expected_ip);
        assert_eq!(adopted.lifecycle_state, LifecycleState::Running);
    }

    #[tokio::test]
    async fn concurrent_provisions_get_distinct_addresses() {
        let hv = Arc::new(FakeHypervisor::new());
        let (prov, _workdir) = test_provisioner(Arc::clone(&hv)).await;
        let prov = Arc::new(prov);

        let futures: Vec<_> = (0..8).map(|_| prov.provision()).collect();
        let instances: Vec<_> = futures::future::join_all(futures)
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();

        let mut ips: Vec<_> = instances.iter().map(|i| i.ip_address).collect();
        ips.sort();
        ips.dedup();
        assert_eq!(ips.len(), 8);
    }
}

//! Typed domain descriptor.
//!
//! All required fields are validated at construction, not at the hypervisor
//! call site, so a malformed spec never reaches `virsh define`.

use std::path::{Path, PathBuf};

use virtscale_fleet::VolumeRef;

use crate::error::ProvisionError;

/// Everything needed to render a domain's XML descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainSpec {
    /// Domain name; equals the instance id.
    pub name: String,
    pub vcpus: u32,
    pub memory_kib: u64,
    /// The instance's ephemeral disk, attached as the primary VirtIO disk.
    pub volume: VolumeRef,
    /// Boot ISO, attached read-only.
    pub iso_path: PathBuf,
    /// Name of the shared NAT network the VirtIO NIC attaches to.
    pub network: String,
}

impl DomainSpec {
    pub fn new(
        name: impl Into<String>,
        vcpus: u32,
        memory_kib: u64,
        volume: VolumeRef,
        iso_path: impl Into<PathBuf>,
        network: impl Into<String>,
    ) -> Result<Self, ProvisionError> {
        let spec = Self {
            name: name.into(),
            vcpus,
            memory_kib,
            volume,
            iso_path: iso_path.into(),
            network: network.into(),
        };
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), ProvisionError> {
        if self.name.is_empty() {
            return Err(ProvisionError::InvalidSpec("domain name is empty".into()));
        }
        if self.vcpus == 0 {
            return Err(ProvisionError::InvalidSpec("vcpus must be >= 1".into()));
        }
        // 64 MiB is already below what any guest image here can boot with;
        // anything lower is a config typo, not a small VM.
        if self.memory_kib < 64 * 1024 {
            return Err(ProvisionError::InvalidSpec(format!(
                "memory_kib {} is below the 65536 KiB floor",
                self.memory_kib
            )));
        }
        if self.iso_path.as_os_str().is_empty() {
            return Err(ProvisionError::InvalidSpec("iso_path is empty".into()));
        }
        if self.network.is_empty() {
            return Err(ProvisionError::InvalidSpec("network name is empty".into()));
        }
        Ok(())
    }

    /// Render the libvirt domain XML.
    pub fn render_xml(&self) -> String {
        format!(
            "<domain type='kvm'>\n  \
               <name>{name}</name>\n  \
               <memory unit='KiB'>{memory}</memory>\n  \
               <vcpu>{vcpus}</vcpu>\n  \
               <os>\n    \
                 <type arch='x86_64'>hvm</type>\n    \
                 <boot dev='cdrom'/>\n  \
               </os>\n  \
               <clock sync='localtime'/>\n  \
               <devices>\n    \
                 <disk type='volume' device='disk'>\n      \
                   <source pool='{pool}' volume='{volume}'/>\n      \
                   <target dev='vda' bus='virtio'/>\n    \
                 </disk>\n    \
                 <disk type='file' device='cdrom'>\n      \
                   <source file='{iso}'/>\n      \
                   <target dev='sda' bus='sata'/>\n      \
                   <readonly/>\n    \
                 </disk>\n    \
                 <interface type='network'>\n      \
                   <source network='{network}'/>\n      \
                   <model type='virtio'/>\n    \
                 </interface>\n    \
                 <graphics type='vnc' port='-1'/>\n    \
                 <serial type='pty'>\n      \
                   <target port='0'/>\n    \
                 </serial>\n    \
                 <console type='pty'>\n      \
                   <target type='serial' port='0'/>\n    \
                 </console>\n  \
               </devices>\n\
             </domain>\n",
            name = xml_escape(&self.name),
            memory = self.memory_kib,
            vcpus = self.vcpus,
            pool = xml_escape(&self.volume.pool),
            volume = xml_escape(&self.volume.name),
            iso = xml_escape(&path_str(&self.iso_path)),
            network = xml_escape(&self.network),
        )
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Escape the five XML-reserved characters for attribute/text positions.
fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

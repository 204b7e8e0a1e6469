//! Domain Ports - Core trait definitions for VmBackup
//!
//! These traits define the boundaries between the backup workflow and the
//! systems it drives: the hypervisor control plane and the filesystem that
//! holds the backups. Adapters implement these traits to provide concrete
//! functionality.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::error;

// =============================================================================
// Backup Types
// =============================================================================

/// Backup mode of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupMode {
    /// Per-VDI export of selected disks
    DiskExport,
    /// Whole-VM export to a single archive
    FullExport,
}

impl std::fmt::Display for BackupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupMode::DiskExport => write!(f, "vdi-export"),
            BackupMode::FullExport => write!(f, "vm-export"),
        }
    }
}

/// On-disk format of a VDI export
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VdiExportFormat {
    #[default]
    Raw,
    Vhd,
}

impl VdiExportFormat {
    /// File extension of the data file
    pub fn extension(&self) -> &'static str {
        match self {
            VdiExportFormat::Raw => "raw",
            VdiExportFormat::Vhd => "vhd",
        }
    }
}

impl std::fmt::Display for VdiExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.extension())
    }
}

impl FromStr for VdiExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "raw" => Ok(VdiExportFormat::Raw),
            "vhd" => Ok(VdiExportFormat::Vhd),
            other => Err(Error::Configuration(format!(
                "vdi_export_format invalid -> {}",
                other
            ))),
        }
    }
}

/// Which object class a backup snapshot lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    /// Snapshot of a whole VM
    Vm,
    /// Snapshot of a single VDI
    Vdi,
}

// =============================================================================
// Hypervisor Records
// =============================================================================

/// VM configuration record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub memory_dynamic_max: u64,
    pub vcpus_max: u32,
    pub vcpus_at_startup: u32,
    /// Template the VM was installed from, if recorded
    pub base_template_name: Option<String>,
    /// Handles of attached VBDs
    pub vbds: Vec<String>,
    /// Handles of attached VIFs
    pub vifs: Vec<String>,
}

/// Kind of block device attachment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VbdType {
    #[default]
    Disk,
    #[serde(rename = "CD")]
    Cd,
    Floppy,
}

impl std::fmt::Display for VbdType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VbdType::Disk => write!(f, "Disk"),
            VbdType::Cd => write!(f, "CD"),
            VbdType::Floppy => write!(f, "Floppy"),
        }
    }
}

impl FromStr for VbdType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "disk" => Ok(VbdType::Disk),
            "cd" => Ok(VbdType::Cd),
            "floppy" => Ok(VbdType::Floppy),
            other => Err(Error::Internal(format!("Unknown VBD type: {}", other))),
        }
    }
}

/// Virtual block device record (attachment of a VDI to a VM)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VbdRecord {
    pub uuid: String,
    pub vbd_type: VbdType,
    /// Guest device name (e.g., xvda)
    pub device: String,
    pub userdevice: String,
    pub bootable: bool,
    pub mode: String,
    pub unpluggable: bool,
    pub empty: bool,
    /// Handle of the attached VDI
    pub vdi: String,
}

/// Virtual disk image record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VdiRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub virtual_size: u64,
    pub vdi_type: String,
    pub sharable: bool,
    pub read_only: bool,
    /// Handle of the storage repository holding the VDI
    pub sr: String,
}

/// Virtual network interface record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VifRecord {
    pub uuid: String,
    pub device: String,
    /// Handle of the connected network
    pub network: String,
    pub mtu: u32,
    pub mac: String,
    pub other_config: BTreeMap<String, String>,
}

/// Network record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub uuid: String,
    pub name_label: String,
}

/// Storage repository record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SrRecord {
    pub uuid: String,
    pub name_label: String,
}

// =============================================================================
// Hypervisor Backend Port
// =============================================================================

/// Port for the hypervisor control plane
///
/// Handles are opaque strings owned by the backend. All operations are
/// awaited one at a time by the orchestrator.
#[async_trait]
pub trait HypervisorBackend: Send + Sync {
    /// Get backend name
    fn backend_name(&self) -> &str;

    /// Names of all non-control-domain, non-snapshot VMs in the pool
    async fn list_vm_names(&self) -> Result<Vec<String>>;

    /// Host names of all pool members
    async fn list_host_names(&self) -> Result<Vec<String>>;

    /// All VM handles carrying the given name label
    async fn get_vms_by_name(&self, name: &str) -> Result<Vec<String>>;

    /// Resolve a VM by exact name.
    ///
    /// Returns `Ok(None)` when no VM has the name and
    /// [`Error::AmbiguousVm`] when more than one does.
    async fn get_vm(&self, name: &str) -> Result<Option<String>> {
        let mut vms = self.get_vms_by_name(name).await?;
        match vms.len() {
            0 => Ok(None),
            1 => Ok(vms.pop()),
            _ => {
                error!("(!) More than one VM exists with same name: {}", name);
                Err(Error::AmbiguousVm {
                    name: name.to_string(),
                })
            }
        }
    }

    async fn get_vm_record(&self, vm: &str) -> Result<VmRecord>;

    async fn get_vbd_record(&self, vbd: &str) -> Result<VbdRecord>;

    async fn get_vdi_record(&self, vdi: &str) -> Result<VdiRecord>;

    async fn get_vif_record(&self, vif: &str) -> Result<VifRecord>;

    async fn get_network_record(&self, network: &str) -> Result<NetworkRecord>;

    async fn get_sr_record(&self, sr: &str) -> Result<SrRecord>;

    /// Snapshot a VM under the given label, returning the snapshot uuid
    async fn snapshot_vm(&self, vm_uuid: &str, label: &str) -> Result<String>;

    /// Snapshot a single VDI, returning the snapshot uuid
    async fn snapshot_vdi(&self, vdi_uuid: &str) -> Result<String>;

    /// Find a leftover snapshot carrying the given label
    async fn find_snapshot_by_label(&self, label: &str, kind: SnapshotKind)
        -> Result<Option<String>>;

    /// Destroy a VM snapshot together with its disks
    async fn destroy_snapshot(&self, uuid: &str) -> Result<()>;

    /// Destroy a VDI
    async fn destroy_vdi(&self, uuid: &str) -> Result<()>;

    /// Turn a VM snapshot into an exportable, non-HA VM
    async fn prepare_vm_snapshot_for_export(&self, uuid: &str) -> Result<()>;

    /// Label a VDI snapshot for later discovery
    async fn tag_vdi(&self, uuid: &str, label: &str) -> Result<()>;

    async fn export_vm(&self, uuid: &str, path: &Path, compress: bool) -> Result<()>;

    async fn export_vdi(&self, uuid: &str, path: &Path, format: VdiExportFormat) -> Result<()>;

    /// Check whether this host is the pool master
    async fn is_pool_master(&self) -> Result<bool>;

    /// Back up the dom0 of every (enabled) host into one file
    async fn backup_hosts(&self, path: &Path, enabled_only: bool) -> Result<()>;

    /// Dump the pool database
    async fn backup_pool_database(&self, path: &Path) -> Result<()>;

    /// Guest OS name as reported by the guest tools
    async fn get_os_version(&self, vm_uuid: &str) -> Result<String>;
}

// =============================================================================
// Space Probe Port
// =============================================================================

/// Port for free-space queries on the backup filesystem
pub trait SpaceProbe: Send + Sync {
    /// Remaining free space of the filesystem holding `path`, in percent
    fn remaining_percent(&self, path: &Path) -> Result<u8>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type HypervisorRef = Arc<dyn HypervisorBackend>;
pub type SpaceProbeRef = Arc<dyn SpaceProbe>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_mode_display() {
        assert_eq!(format!("{}", BackupMode::DiskExport), "vdi-export");
        assert_eq!(format!("{}", BackupMode::FullExport), "vm-export");
    }

    #[test]
    fn test_vdi_export_format_parse() {
        assert_eq!("raw".parse::<VdiExportFormat>().unwrap(), VdiExportFormat::Raw);
        assert_eq!("VHD".parse::<VdiExportFormat>().unwrap(), VdiExportFormat::Vhd);
        assert!("qcow2".parse::<VdiExportFormat>().is_err());
        assert_eq!(VdiExportFormat::Vhd.extension(), "vhd");
    }

    #[test]
    fn test_vbd_type_parse() {
        assert_eq!("Disk".parse::<VbdType>().unwrap(), VbdType::Disk);
        assert_eq!("CD".parse::<VbdType>().unwrap(), VbdType::Cd);
        assert_eq!(format!("{}", VbdType::Cd), "CD");
    }
}

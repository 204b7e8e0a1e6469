//! Mock hypervisor backend for testing and previews.

use crate::domain::ports::{
    HypervisorBackend, NetworkRecord, SnapshotKind, SrRecord, VbdRecord, VbdType,
    VdiExportFormat, VdiRecord, VifRecord, VmRecord,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

/// Operations whose failure can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    ListVms,
    GetVmRecord,
    SnapshotVm,
    SnapshotVdi,
    PrepareSnapshot,
    TagVdi,
    ExportVm,
    ExportVdi,
    DestroySnapshot,
    DestroyVdi,
    BackupHosts,
    BackupPoolDatabase,
}

#[derive(Debug, Clone)]
struct MockSnapshot {
    label: String,
    kind: SnapshotKind,
}

#[derive(Default)]
struct MockState {
    vm_order: Vec<String>,
    vms: HashMap<String, VmRecord>,
    os_versions: HashMap<String, String>,
    vbds: HashMap<String, VbdRecord>,
    vdis: HashMap<String, VdiRecord>,
    vifs: HashMap<String, VifRecord>,
    networks: HashMap<String, NetworkRecord>,
    srs: HashMap<String, SrRecord>,
    default_sr: String,
    snapshots: BTreeMap<String, MockSnapshot>,
    hosts: Vec<String>,
    pool_master: bool,
    failures: HashSet<MockOp>,
    late_failures: HashSet<MockOp>,
    attempts: HashMap<MockOp, u32>,
    next_id: u64,
}

impl MockState {
    fn new_id(&mut self, kind: &str) -> String {
        self.next_id += 1;
        format!("{}-{:08}", kind, self.next_id)
    }
}

/// In-memory hypervisor.
///
/// Simulates a pool with VMs, disks, networks and snapshots. Exports
/// write small placeholder files so the filesystem side of a backup can
/// be exercised. Any operation listed in [`MockOp`] can be made to fail.
pub struct MockBackend {
    state: RwLock<MockState>,
}

impl MockBackend {
    /// Create an empty pool whose local host is the master
    pub fn new() -> Self {
        let mut state = MockState {
            pool_master: true,
            hosts: vec!["xs-mock-01".to_string()],
            ..Default::default()
        };
        let sr = state.new_id("sr");
        state.srs.insert(
            sr.clone(),
            SrRecord {
                uuid: sr.clone(),
                name_label: "Local storage".to_string(),
            },
        );
        state.default_sr = sr;

        Self {
            state: RwLock::new(state),
        }
    }

    /// A small pool for dry runs
    pub fn sample_pool() -> Self {
        info!("Creating mock hypervisor backend with sample pool");
        let mock = Self::new();
        for name in ["web1", "web2", "db1", "test1"] {
            let vm = mock.add_vm(name);
            mock.add_disk(&vm, "xvda");
            mock.add_vif(&vm, "0", "Pool-wide network associated with eth0");
        }
        mock
    }

    /// Add a VM, returning its uuid
    pub fn add_vm(&self, name: &str) -> String {
        let mut state = self.state.write();
        let uuid = state.new_id("vm");
        state.vms.insert(
            uuid.clone(),
            VmRecord {
                uuid: uuid.clone(),
                name_label: name.to_string(),
                name_description: format!("{} (mock)", name),
                memory_dynamic_max: 2 * 1024 * 1024 * 1024,
                vcpus_max: 2,
                vcpus_at_startup: 2,
                base_template_name: Some("Other install media".to_string()),
                vbds: Vec::new(),
                vifs: Vec::new(),
            },
        );
        state.vm_order.push(uuid.clone());
        uuid
    }

    /// Attach a disk to a VM, returning the VDI uuid
    pub fn add_disk(&self, vm: &str, device: &str) -> String {
        self.attach(vm, device, VbdType::Disk)
    }

    /// Attach an empty CD drive to a VM
    pub fn add_cdrom(&self, vm: &str, device: &str) {
        self.attach(vm, device, VbdType::Cd);
    }

    fn attach(&self, vm: &str, device: &str, vbd_type: VbdType) -> String {
        let mut state = self.state.write();
        let vdi = state.new_id("vdi");
        let vbd = state.new_id("vbd");
        let sr = state.default_sr.clone();
        let userdevice = state
            .vms
            .get(vm)
            .map_or(0, |record| record.vbds.len())
            .to_string();

        state.vdis.insert(
            vdi.clone(),
            VdiRecord {
                uuid: vdi.clone(),
                name_label: format!("{} disk", device),
                name_description: String::new(),
                virtual_size: 10 * 1024 * 1024 * 1024,
                vdi_type: "user".to_string(),
                sharable: false,
                read_only: false,
                sr,
            },
        );
        state.vbds.insert(
            vbd.clone(),
            VbdRecord {
                uuid: vbd.clone(),
                vbd_type,
                device: device.to_string(),
                userdevice,
                bootable: vbd_type == VbdType::Disk,
                mode: "RW".to_string(),
                unpluggable: false,
                empty: vbd_type != VbdType::Disk,
                vdi: vdi.clone(),
            },
        );
        if let Some(record) = state.vms.get_mut(vm) {
            record.vbds.push(vbd);
        }
        vdi
    }

    /// Attach a network interface, creating the network on first use
    pub fn add_vif(&self, vm: &str, device: &str, network_name: &str) -> String {
        let mut state = self.state.write();
        let existing = state
            .networks
            .values()
            .find(|n| n.name_label == network_name)
            .map(|n| n.uuid.clone());
        let network = match existing {
            Some(uuid) => uuid,
            None => {
                let uuid = state.new_id("net");
                state.networks.insert(
                    uuid.clone(),
                    NetworkRecord {
                        uuid: uuid.clone(),
                        name_label: network_name.to_string(),
                    },
                );
                uuid
            }
        };

        let vif = state.new_id("vif");
        let mac = format!("02:00:00:00:00:{:02x}", state.next_id % 256);
        state.vifs.insert(
            vif.clone(),
            VifRecord {
                uuid: vif.clone(),
                device: device.to_string(),
                network,
                mtu: 1500,
                mac,
                other_config: BTreeMap::new(),
            },
        );
        if let Some(record) = state.vms.get_mut(vm) {
            record.vifs.push(vif.clone());
        }
        vif
    }

    /// Leave a snapshot behind as an interrupted run would
    pub fn add_stale_snapshot(&self, label: &str, kind: SnapshotKind) -> String {
        let mut state = self.state.write();
        let uuid = state.new_id("snap");
        state.snapshots.insert(
            uuid.clone(),
            MockSnapshot {
                label: label.to_string(),
                kind,
            },
        );
        uuid
    }

    /// Make an operation fail from now on
    pub fn fail(&self, op: MockOp) {
        self.state.write().failures.insert(op);
    }

    /// Make an operation fail after it has written its output file
    pub fn fail_after_write(&self, op: MockOp) {
        self.state.write().late_failures.insert(op);
    }

    pub fn set_pool_master(&self, master: bool) {
        self.state.write().pool_master = master;
    }

    /// Labels of all snapshots currently present
    pub fn snapshot_labels(&self) -> Vec<String> {
        self.state
            .read()
            .snapshots
            .values()
            .map(|s| s.label.clone())
            .collect()
    }

    /// How often an operation was attempted
    pub fn attempts(&self, op: MockOp) -> u32 {
        self.state.read().attempts.get(&op).copied().unwrap_or(0)
    }

    fn check(&self, op: MockOp) -> Result<()> {
        let mut state = self.state.write();
        *state.attempts.entry(op).or_default() += 1;
        if state.failures.contains(&op) {
            debug!("Injected failure for {:?}", op);
            return Err(Error::HypervisorCommand {
                command: format!("{:?}", op),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn check_written(&self, op: MockOp) -> Result<()> {
        if self.state.read().late_failures.contains(&op) {
            debug!("Injected failure for {:?} after write", op);
            return Err(Error::HypervisorCommand {
                command: format!("{:?}", op),
                reason: "connection lost during export".to_string(),
            });
        }
        Ok(())
    }

    fn require_snapshot(&self, uuid: &str, kind: SnapshotKind) -> Result<()> {
        let state = self.state.read();
        match state.snapshots.get(uuid) {
            Some(snap) if snap.kind == kind => Ok(()),
            _ => Err(not_found("snapshot", uuid)),
        }
    }

    fn new_snapshot(&self, label: String, kind: SnapshotKind) -> String {
        let mut state = self.state.write();
        let uuid = state.new_id("snap");
        state.snapshots.insert(uuid.clone(), MockSnapshot { label, kind });
        uuid
    }

    fn remove_snapshot(&self, uuid: &str, kind: SnapshotKind) -> Result<()> {
        self.require_snapshot(uuid, kind)?;
        self.state.write().snapshots.remove(uuid);
        Ok(())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(kind: &str, id: &str) -> Error {
    Error::RecordNotFound {
        kind: kind.to_string(),
        id: id.to_string(),
    }
}

async fn write_placeholder(path: &Path, content: String) -> Result<()> {
    tokio::fs::write(path, content).await?;
    Ok(())
}

#[async_trait]
impl HypervisorBackend for MockBackend {
    fn backend_name(&self) -> &str {
        "mock"
    }

    async fn list_vm_names(&self) -> Result<Vec<String>> {
        self.check(MockOp::ListVms)?;
        let state = self.state.read();
        Ok(state
            .vm_order
            .iter()
            .filter_map(|uuid| state.vms.get(uuid))
            .map(|vm| vm.name_label.clone())
            .collect())
    }

    async fn list_host_names(&self) -> Result<Vec<String>> {
        Ok(self.state.read().hosts.clone())
    }

    async fn get_vms_by_name(&self, name: &str) -> Result<Vec<String>> {
        let state = self.state.read();
        Ok(state
            .vm_order
            .iter()
            .filter(|uuid| state.vms.get(*uuid).map_or(false, |vm| vm.name_label == name))
            .cloned()
            .collect())
    }

    async fn get_vm_record(&self, vm: &str) -> Result<VmRecord> {
        self.check(MockOp::GetVmRecord)?;
        self.state
            .read()
            .vms
            .get(vm)
            .cloned()
            .ok_or_else(|| not_found("VM", vm))
    }

    async fn get_vbd_record(&self, vbd: &str) -> Result<VbdRecord> {
        self.state
            .read()
            .vbds
            .get(vbd)
            .cloned()
            .ok_or_else(|| not_found("VBD", vbd))
    }

    async fn get_vdi_record(&self, vdi: &str) -> Result<VdiRecord> {
        self.state
            .read()
            .vdis
            .get(vdi)
            .cloned()
            .ok_or_else(|| not_found("VDI", vdi))
    }

    async fn get_vif_record(&self, vif: &str) -> Result<VifRecord> {
        self.state
            .read()
            .vifs
            .get(vif)
            .cloned()
            .ok_or_else(|| not_found("VIF", vif))
    }

    async fn get_network_record(&self, network: &str) -> Result<NetworkRecord> {
        self.state
            .read()
            .networks
            .get(network)
            .cloned()
            .ok_or_else(|| not_found("network", network))
    }

    async fn get_sr_record(&self, sr: &str) -> Result<SrRecord> {
        self.state
            .read()
            .srs
            .get(sr)
            .cloned()
            .ok_or_else(|| not_found("SR", sr))
    }

    async fn snapshot_vm(&self, vm_uuid: &str, label: &str) -> Result<String> {
        self.check(MockOp::SnapshotVm)?;
        if !self.state.read().vms.contains_key(vm_uuid) {
            return Err(not_found("VM", vm_uuid));
        }
        Ok(self.new_snapshot(label.to_string(), SnapshotKind::Vm))
    }

    async fn snapshot_vdi(&self, vdi_uuid: &str) -> Result<String> {
        self.check(MockOp::SnapshotVdi)?;
        let label = self
            .state
            .read()
            .vdis
            .get(vdi_uuid)
            .map(|vdi| vdi.name_label.clone())
            .ok_or_else(|| not_found("VDI", vdi_uuid))?;
        Ok(self.new_snapshot(label, SnapshotKind::Vdi))
    }

    async fn find_snapshot_by_label(
        &self,
        label: &str,
        kind: SnapshotKind,
    ) -> Result<Option<String>> {
        Ok(self
            .state
            .read()
            .snapshots
            .iter()
            .find(|(_, s)| s.label == label && s.kind == kind)
            .map(|(uuid, _)| uuid.clone()))
    }

    async fn destroy_snapshot(&self, uuid: &str) -> Result<()> {
        self.check(MockOp::DestroySnapshot)?;
        self.remove_snapshot(uuid, SnapshotKind::Vm)
    }

    async fn destroy_vdi(&self, uuid: &str) -> Result<()> {
        self.check(MockOp::DestroyVdi)?;
        self.remove_snapshot(uuid, SnapshotKind::Vdi)
    }

    async fn prepare_vm_snapshot_for_export(&self, uuid: &str) -> Result<()> {
        self.check(MockOp::PrepareSnapshot)?;
        self.require_snapshot(uuid, SnapshotKind::Vm)
    }

    async fn tag_vdi(&self, uuid: &str, label: &str) -> Result<()> {
        self.check(MockOp::TagVdi)?;
        self.require_snapshot(uuid, SnapshotKind::Vdi)?;
        if let Some(snap) = self.state.write().snapshots.get_mut(uuid) {
            snap.label = label.to_string();
        }
        Ok(())
    }

    async fn export_vm(&self, uuid: &str, path: &Path, compress: bool) -> Result<()> {
        self.check(MockOp::ExportVm)?;
        self.require_snapshot(uuid, SnapshotKind::Vm)?;
        write_placeholder(path, format!("xva {} compress={}\n", uuid, compress)).await?;
        self.check_written(MockOp::ExportVm)
    }

    async fn export_vdi(&self, uuid: &str, path: &Path, format: VdiExportFormat) -> Result<()> {
        self.check(MockOp::ExportVdi)?;
        self.require_snapshot(uuid, SnapshotKind::Vdi)?;
        write_placeholder(path, format!("{} {}\n", format, uuid)).await?;
        self.check_written(MockOp::ExportVdi)
    }

    async fn is_pool_master(&self) -> Result<bool> {
        Ok(self.state.read().pool_master)
    }

    async fn backup_hosts(&self, path: &Path, enabled_only: bool) -> Result<()> {
        self.check(MockOp::BackupHosts)?;
        let hosts = self.state.read().hosts.join(",");
        write_placeholder(path, format!("hosts {} enabled_only={}\n", hosts, enabled_only)).await
    }

    async fn backup_pool_database(&self, path: &Path) -> Result<()> {
        self.check(MockOp::BackupPoolDatabase)?;
        write_placeholder(path, "pool database\n".to_string()).await
    }

    async fn get_os_version(&self, vm_uuid: &str) -> Result<String> {
        Ok(self
            .state
            .read()
            .os_versions
            .get(vm_uuid)
            .cloned()
            .unwrap_or_else(|| "None".to_string()))
    }
}

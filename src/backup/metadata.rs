//! VM Metadata Capture
//!
//! Writes a plain-text record of a VM's configuration, its disks and its
//! network interfaces next to each backup, so a restore can rebuild the VM
//! around the exported data.

use crate::domain::ports::{HypervisorBackend, VbdType, VmRecord};
use crate::error::Result;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Guest device name to VDI uuid, for every attached disk
pub type DeviceMap = BTreeMap<String, String>;

/// Write the metadata file for `vm` and return its device map
pub async fn capture_metadata(
    hypervisor: &dyn HypervisorBackend,
    vm: &VmRecord,
    meta_file: &Path,
) -> Result<DeviceMap> {
    let (text, devices) = render_metadata(hypervisor, vm).await?;

    debug!("(i) Writing metadata file {:?}", meta_file);
    fs::write(meta_file, text).await?;

    debug!("(i) Stored VDI data: {:?}", devices);
    Ok(devices)
}

/// Render the metadata record without touching the filesystem
pub async fn render_metadata(
    hypervisor: &dyn HypervisorBackend,
    vm: &VmRecord,
) -> Result<(String, DeviceMap)> {
    let mut out = String::new();
    let mut devices = DeviceMap::new();

    debug!("(i) Recording VM metadata: {}", vm.name_label);
    let os_version = hypervisor.get_os_version(&vm.uuid).await?;

    out.push_str("******* VM *******\n");
    line(&mut out, "name_label", &vm.name_label);
    line(&mut out, "name_description", &vm.name_description);
    line(&mut out, "memory_dynamic_max", &vm.memory_dynamic_max);
    line(&mut out, "VCPUs_max", &vm.vcpus_max);
    line(&mut out, "VCPUs_at_startup", &vm.vcpus_at_startup);
    if let Some(template) = vm.base_template_name.as_deref().filter(|t| !t.is_empty()) {
        line(&mut out, "base_template_name", &template);
    }
    line(&mut out, "os_version", &os_version);
    line(&mut out, "orig_uuid", &vm.uuid);
    out.push('\n');

    for vbd_ref in &vm.vbds {
        let vbd = hypervisor.get_vbd_record(vbd_ref).await?;
        if vbd.vbd_type != VbdType::Disk {
            debug!("(i) Not a disk... skipping: {}", vbd.vbd_type);
            continue;
        }

        let vdi = hypervisor.get_vdi_record(&vbd.vdi).await?;
        let sr = hypervisor.get_sr_record(&vdi.sr).await?;

        debug!("(i) Storing VDI metadata: {}:{}", vbd.device, vdi.uuid);
        devices.insert(vbd.device.clone(), vdi.uuid.clone());

        out.push_str("******* DISK *******\n");
        line(&mut out, "device", &vbd.device);
        line(&mut out, "userdevice", &vbd.userdevice);
        line(&mut out, "bootable", &vbd.bootable);
        line(&mut out, "mode", &vbd.mode);
        line(&mut out, "type", &vbd.vbd_type);
        line(&mut out, "unpluggable", &vbd.unpluggable);
        line(&mut out, "empty", &vbd.empty);
        line(&mut out, "orig_uuid", &vbd.uuid);
        out.push_str("---- VDI ----\n");
        line(&mut out, "name_label", &vdi.name_label);
        line(&mut out, "name_description", &vdi.name_description);
        line(&mut out, "virtual_size", &vdi.virtual_size);
        line(&mut out, "type", &vdi.vdi_type);
        line(&mut out, "sharable", &vdi.sharable);
        line(&mut out, "read_only", &vdi.read_only);
        line(&mut out, "orig_uuid", &vdi.uuid);
        line(&mut out, "orig_sr_uuid", &sr.uuid);
        out.push('\n');
    }

    for vif_ref in &vm.vifs {
        let vif = hypervisor.get_vif_record(vif_ref).await?;
        let network = hypervisor.get_network_record(&vif.network).await?;

        debug!("(i) Recording VIF metadata: {}", vif.device);
        out.push_str("******* VIF *******\n");
        line(&mut out, "device", &vif.device);
        line(&mut out, "network_name_label", &network.name_label);
        line(&mut out, "MTU", &vif.mtu);
        line(&mut out, "MAC", &vif.mac);
        line(&mut out, "other_config", format!("{:?}", vif.other_config));
        line(&mut out, "orig_uuid", &vif.uuid);
        out.push('\n');
    }

    Ok((out, devices))
}

fn line(out: &mut String, key: &str, value: impl Display) {
    out.push_str(&format!("{}={}\n", key, value));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::MockBackend;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_capture_writes_sections_and_device_map() {
        let mock = MockBackend::new();
        let vm = mock.add_vm("db1");
        let xvda = mock.add_disk(&vm, "xvda");
        let xvdb = mock.add_disk(&vm, "xvdb");
        mock.add_cdrom(&vm, "xvdd");
        mock.add_vif(&vm, "0", "Pool-wide network");

        let record = mock.get_vm_record(&vm).await.unwrap();
        let tmp = TempDir::new().unwrap();
        let meta = tmp.path().join("backup.meta");

        let devices = capture_metadata(&mock, &record, &meta).await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices.get("xvda"), Some(&xvda));
        assert_eq!(devices.get("xvdb"), Some(&xvdb));
        assert!(!devices.contains_key("xvdd"));

        let text = std::fs::read_to_string(&meta).unwrap();
        assert!(text.starts_with("******* VM *******\nname_label=db1\n"));
        assert_eq!(text.matches("******* DISK *******").count(), 2);
        assert_eq!(text.matches("---- VDI ----").count(), 2);
        assert!(text.contains("network_name_label=Pool-wide network"));
        assert!(text.contains(&format!("orig_uuid={}", vm)));
    }
}

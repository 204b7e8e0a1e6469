//! XenServer `xe` CLI Adapter
//!
//! Drives the local pool through the `xe` command line tool. Every call runs
//! one `xe` process; a non-zero exit status is an operation failure and an
//! empty answer to a query means "none".

use crate::domain::ports::{
    HypervisorBackend, NetworkRecord, SnapshotKind, SrRecord, VbdRecord, VdiExportFormat,
    VdiRecord, VifRecord, VmRecord,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::process::Command;
use tracing::{debug, instrument};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the xe adapter
#[derive(Debug, Clone)]
pub struct XeConfig {
    /// Path of the `xe` binary
    pub xe_path: PathBuf,
    /// Pool role file of the local host
    pub pool_conf: PathBuf,
}

impl Default for XeConfig {
    fn default() -> Self {
        Self {
            xe_path: PathBuf::from("/opt/xensource/bin/xe"),
            pool_conf: PathBuf::from("/etc/xensource/pool.conf"),
        }
    }
}

// =============================================================================
// Output Parsing
// =============================================================================

/// Split a `--minimal` answer into its values
fn minimal_list(output: &str) -> Vec<String> {
    output
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parse a map parameter (`key: value; key2: value2`)
fn parse_map(output: &str) -> BTreeMap<String, String> {
    output
        .split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once(':')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Guest OS name from the `os-version` map; `None` when tools report nothing
fn parse_os_version(output: &str) -> String {
    let first = output.split(';').next().unwrap_or_default().trim();
    let name = first.strip_prefix("name:").unwrap_or(first).trim();
    if name.is_empty() {
        "None".to_string()
    } else {
        name.to_string()
    }
}

fn arg(key: &str, value: impl std::fmt::Display) -> String {
    format!("{}={}", key, value)
}

// =============================================================================
// xe Adapter
// =============================================================================

/// Hypervisor backend for the local XenServer pool
pub struct XeCliBackend {
    config: XeConfig,
}

impl XeCliBackend {
    pub fn new(config: XeConfig) -> Self {
        Self { config }
    }

    /// Run one xe command, returning its trimmed standard output
    async fn xe(&self, args: &[String]) -> Result<String> {
        let command = args.first().cloned().unwrap_or_default();
        debug!("(i) xe {}", args.join(" "));

        let output = Command::new(&self.config.xe_path)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::HypervisorCommand {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::HypervisorCommand {
                command,
                reason: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn xe_list(&self, args: &[String]) -> Result<Vec<String>> {
        Ok(minimal_list(&self.xe(args).await?))
    }

    /// One field of one object
    async fn field(&self, class: &str, uuid: &str, name: &str) -> Result<String> {
        self.xe(&[
            format!("{}-list", class),
            arg("uuid", uuid),
            arg("params", name),
            "--minimal".to_string(),
        ])
        .await
    }

    async fn parsed<T: FromStr>(&self, class: &str, uuid: &str, name: &str) -> Result<T> {
        let value = self.field(class, uuid, name).await?;
        value.parse().map_err(|_| Error::HypervisorCommand {
            command: format!("{}-list", class),
            reason: format!("unexpected {} value: {}", name, value),
        })
    }

    async fn flag(&self, class: &str, uuid: &str, name: &str) -> Result<bool> {
        Ok(self.field(class, uuid, name).await?.eq_ignore_ascii_case("true"))
    }

    /// Ensure an object exists before reading its fields
    async fn require(&self, class: &str, uuid: &str) -> Result<()> {
        let found = self
            .xe_list(&[
                format!("{}-list", class),
                arg("uuid", uuid),
                arg("params", "uuid"),
                "--minimal".to_string(),
            ])
            .await?;
        if found.is_empty() {
            return Err(Error::RecordNotFound {
                kind: class.to_string(),
                id: uuid.to_string(),
            });
        }
        Ok(())
    }

    async fn first_by_label(&self, class: &str, label: &str) -> Result<Option<String>> {
        let found = self
            .xe_list(&[
                format!("{}-list", class),
                arg("name-label", label),
                arg("params", "uuid"),
                "--minimal".to_string(),
            ])
            .await?;
        Ok(found.into_iter().next())
    }
}

#[async_trait]
impl HypervisorBackend for XeCliBackend {
    fn backend_name(&self) -> &str {
        "xe"
    }

    #[instrument(skip(self))]
    async fn list_vm_names(&self) -> Result<Vec<String>> {
        self.xe_list(&[
            "vm-list".to_string(),
            arg("is-control-domain", false),
            arg("is-a-snapshot", false),
            arg("params", "name-label"),
            "--minimal".to_string(),
        ])
        .await
    }

    #[instrument(skip(self))]
    async fn list_host_names(&self) -> Result<Vec<String>> {
        self.xe_list(&[
            "host-list".to_string(),
            arg("params", "hostname"),
            "--minimal".to_string(),
        ])
        .await
    }

    #[instrument(skip(self))]
    async fn get_vms_by_name(&self, name: &str) -> Result<Vec<String>> {
        self.xe_list(&[
            "vm-list".to_string(),
            arg("name-label", name),
            arg("params", "uuid"),
            "--minimal".to_string(),
        ])
        .await
    }

    #[instrument(skip(self))]
    async fn get_vm_record(&self, vm: &str) -> Result<VmRecord> {
        self.require("vm", vm).await?;

        // Absent when the VM was not installed from a template
        let base_template_name = self
            .xe(&[
                "vm-param-get".to_string(),
                arg("uuid", vm),
                arg("param-name", "other-config"),
                arg("param-key", "base_template_name"),
            ])
            .await
            .ok()
            .filter(|t| !t.is_empty());

        Ok(VmRecord {
            uuid: vm.to_string(),
            name_label: self.field("vm", vm, "name-label").await?,
            name_description: self.field("vm", vm, "name-description").await?,
            memory_dynamic_max: self.parsed("vm", vm, "memory-dynamic-max").await?,
            vcpus_max: self.parsed("vm", vm, "VCPUs-max").await?,
            vcpus_at_startup: self.parsed("vm", vm, "VCPUs-at-startup").await?,
            base_template_name,
            vbds: self
                .xe_list(&[
                    "vbd-list".to_string(),
                    arg("vm-uuid", vm),
                    arg("params", "uuid"),
                    "--minimal".to_string(),
                ])
                .await?,
            vifs: self
                .xe_list(&[
                    "vif-list".to_string(),
                    arg("vm-uuid", vm),
                    arg("params", "uuid"),
                    "--minimal".to_string(),
                ])
                .await?,
        })
    }

    #[instrument(skip(self))]
    async fn get_vbd_record(&self, vbd: &str) -> Result<VbdRecord> {
        self.require("vbd", vbd).await?;
        Ok(VbdRecord {
            uuid: vbd.to_string(),
            vbd_type: self.parsed("vbd", vbd, "type").await?,
            device: self.field("vbd", vbd, "device").await?,
            userdevice: self.field("vbd", vbd, "userdevice").await?,
            bootable: self.flag("vbd", vbd, "bootable").await?,
            mode: self.field("vbd", vbd, "mode").await?,
            unpluggable: self.flag("vbd", vbd, "unpluggable").await?,
            empty: self.flag("vbd", vbd, "empty").await?,
            vdi: self.field("vbd", vbd, "vdi-uuid").await?,
        })
    }

    #[instrument(skip(self))]
    async fn get_vdi_record(&self, vdi: &str) -> Result<VdiRecord> {
        self.require("vdi", vdi).await?;
        Ok(VdiRecord {
            uuid: vdi.to_string(),
            name_label: self.field("vdi", vdi, "name-label").await?,
            name_description: self.field("vdi", vdi, "name-description").await?,
            virtual_size: self.parsed("vdi", vdi, "virtual-size").await?,
            vdi_type: self.field("vdi", vdi, "type").await?,
            sharable: self.flag("vdi", vdi, "sharable").await?,
            read_only: self.flag("vdi", vdi, "read-only").await?,
            sr: self.field("vdi", vdi, "sr-uuid").await?,
        })
    }

    #[instrument(skip(self))]
    async fn get_vif_record(&self, vif: &str) -> Result<VifRecord> {
        self.require("vif", vif).await?;
        Ok(VifRecord {
            uuid: vif.to_string(),
            device: self.field("vif", vif, "device").await?,
            network: self.field("vif", vif, "network-uuid").await?,
            mtu: self.parsed("vif", vif, "MTU").await?,
            mac: self.field("vif", vif, "MAC").await?,
            other_config: parse_map(&self.field("vif", vif, "other-config").await?),
        })
    }

    #[instrument(skip(self))]
    async fn get_network_record(&self, network: &str) -> Result<NetworkRecord> {
        self.require("network", network).await?;
        Ok(NetworkRecord {
            uuid: network.to_string(),
            name_label: self.field("network", network, "name-label").await?,
        })
    }

    #[instrument(skip(self))]
    async fn get_sr_record(&self, sr: &str) -> Result<SrRecord> {
        self.require("sr", sr).await?;
        Ok(SrRecord {
            uuid: sr.to_string(),
            name_label: self.field("sr", sr, "name-label").await?,
        })
    }

    #[instrument(skip(self))]
    async fn snapshot_vm(&self, vm_uuid: &str, label: &str) -> Result<String> {
        self.xe(&[
            "vm-snapshot".to_string(),
            arg("vm", vm_uuid),
            arg("new-name-label", label),
        ])
        .await
    }

    #[instrument(skip(self))]
    async fn snapshot_vdi(&self, vdi_uuid: &str) -> Result<String> {
        self.xe(&["vdi-snapshot".to_string(), arg("uuid", vdi_uuid)])
            .await
    }

    #[instrument(skip(self))]
    async fn find_snapshot_by_label(
        &self,
        label: &str,
        kind: SnapshotKind,
    ) -> Result<Option<String>> {
        match kind {
            SnapshotKind::Vm => match self.first_by_label("vm", label).await? {
                Some(uuid) => Ok(Some(uuid)),
                None => self.first_by_label("snapshot", label).await,
            },
            SnapshotKind::Vdi => self.first_by_label("vdi", label).await,
        }
    }

    #[instrument(skip(self))]
    async fn destroy_snapshot(&self, uuid: &str) -> Result<()> {
        self.xe(&[
            "vm-uninstall".to_string(),
            arg("uuid", uuid),
            arg("force", true),
        ])
        .await
        .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn destroy_vdi(&self, uuid: &str) -> Result<()> {
        self.xe(&["vdi-destroy".to_string(), arg("uuid", uuid)])
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn prepare_vm_snapshot_for_export(&self, uuid: &str) -> Result<()> {
        self.xe(&[
            "template-param-set".to_string(),
            arg("is-a-template", false),
            arg("ha-always-run", false),
            arg("uuid", uuid),
        ])
        .await
        .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn tag_vdi(&self, uuid: &str, label: &str) -> Result<()> {
        self.xe(&[
            "vdi-param-set".to_string(),
            arg("uuid", uuid),
            arg("name-label", label),
        ])
        .await
        .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn export_vm(&self, uuid: &str, path: &Path, compress: bool) -> Result<()> {
        self.xe(&[
            "vm-export".to_string(),
            arg("uuid", uuid),
            arg("filename", path.display()),
            arg("compress", compress),
        ])
        .await
        .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn export_vdi(&self, uuid: &str, path: &Path, format: VdiExportFormat) -> Result<()> {
        self.xe(&[
            "vdi-export".to_string(),
            arg("format", format),
            arg("uuid", uuid),
            arg("filename", path.display()),
        ])
        .await
        .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn is_pool_master(&self) -> Result<bool> {
        let role = tokio::fs::read_to_string(&self.config.pool_conf).await?;
        Ok(role.trim() == "master")
    }

    #[instrument(skip(self))]
    async fn backup_hosts(&self, path: &Path, enabled_only: bool) -> Result<()> {
        let mut args = vec![
            "host-backup".to_string(),
            arg("file-name", path.display()),
            "--multiple".to_string(),
        ];
        if enabled_only {
            args.push(arg("enabled", true));
        }
        self.xe(&args).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn backup_pool_database(&self, path: &Path) -> Result<()> {
        self.xe(&[
            "pool-dump-database".to_string(),
            arg("file-name", path.display()),
        ])
        .await
        .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn get_os_version(&self, vm_uuid: &str) -> Result<String> {
        let output = self.field("vm", vm_uuid, "os-version").await?;
        Ok(parse_os_version(&output))
    }
}

//! Backup Orchestrator
//!
//! Drives the per-VM backup workflow against the hypervisor port:
//!
//! 1. Check free space on the backup filesystem
//! 2. Resolve the VM and capture its metadata
//! 3. Remove any snapshot left behind by an interrupted run
//! 4. Snapshot, prepare and export
//! 5. Destroy the snapshot and rotate old artifacts
//!
//! A failure in steps 2-4 rolls back what the item created and moves on to
//! the next item. Falling below the space threshold ends the batch.

use crate::backup::artifacts::{self, ArtifactFamily, ArtifactSet};
use crate::backup::config::BackupConfig;
use crate::backup::job::BackupJob;
use crate::backup::metadata::capture_metadata;
use crate::backup::rotation;
use crate::backup::summary::BatchSummary;
use crate::domain::ports::{
    BackupMode, HypervisorBackend, HypervisorRef, SnapshotKind, SpaceProbeRef, VmRecord,
};
use crate::error::{Error, Result};
use crate::selection::{Inventory, Selections};
use chrono::Local;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// Run Report
// =============================================================================

/// Summaries of every batch executed in one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub hosts: Option<BatchSummary>,
    pub pool_db: Option<BatchSummary>,
    pub disk_export: Option<BatchSummary>,
    pub full_export: Option<BatchSummary>,
}

impl RunReport {
    /// Total errors across all batches
    pub fn error_count(&self) -> u32 {
        self.batches().map(|s| s.error).sum()
    }

    /// Total warnings across all batches
    pub fn warning_count(&self) -> u32 {
        self.batches().map(|s| s.warning).sum()
    }

    fn batches(&self) -> impl Iterator<Item = &BatchSummary> {
        [&self.hosts, &self.pool_db, &self.disk_export, &self.full_export]
            .into_iter()
            .flatten()
    }
}

// =============================================================================
// Rollback
// =============================================================================

struct TrackedSnapshot {
    uuid: String,
    kind: SnapshotKind,
    label: String,
}

/// Everything one item has created so far; undone if the item fails
struct Rollback<'a> {
    hypervisor: &'a dyn HypervisorBackend,
    meta_file: Option<PathBuf>,
    data_file: Option<PathBuf>,
    snapshot: Option<TrackedSnapshot>,
}

impl<'a> Rollback<'a> {
    fn new(hypervisor: &'a dyn HypervisorBackend) -> Self {
        Self {
            hypervisor,
            meta_file: None,
            data_file: None,
            snapshot: None,
        }
    }

    fn track_meta(&mut self, path: &Path) {
        self.meta_file = Some(path.to_path_buf());
    }

    fn track_data(&mut self, path: &Path) {
        self.data_file = Some(path.to_path_buf());
    }

    fn track_snapshot(&mut self, uuid: &str, kind: SnapshotKind, label: &str) {
        self.snapshot = Some(TrackedSnapshot {
            uuid: uuid.to_string(),
            kind,
            label: label.to_string(),
        });
    }

    /// The export is durable; the artifacts stay and only the snapshot is
    /// handed back for regular cleanup
    fn commit(&mut self) -> Option<TrackedSnapshot> {
        self.meta_file = None;
        self.data_file = None;
        self.snapshot.take()
    }

    async fn unwind(self) {
        if let Some(snap) = self.snapshot {
            debug!("(i) Rolling back snapshot: {}", snap.label);
            if let Err(e) = destroy_snapshot(self.hypervisor, &snap.uuid, snap.kind).await {
                error!("(!) Unable to destroy snapshot {}: {}", snap.label, e);
            }
        }
        for path in [self.data_file, self.meta_file].into_iter().flatten() {
            debug!("(i) Rolling back file: {:?}", path);
            artifacts::remove_artifact(&path).await;
        }
    }
}

async fn destroy_snapshot(
    hypervisor: &dyn HypervisorBackend,
    uuid: &str,
    kind: SnapshotKind,
) -> Result<()> {
    match kind {
        SnapshotKind::Vm => hypervisor.destroy_snapshot(uuid).await,
        SnapshotKind::Vdi => hypervisor.destroy_vdi(uuid).await,
    }
}

/// Count a failed item; returns true when the batch has to stop
fn record_failure(summary: &mut BatchSummary, err: &Error, item: &str) -> bool {
    summary.record(err);
    error!("(!) {}", err);
    if err.aborts_batch() {
        error!("(!) Aborting remaining backups");
        return true;
    }
    info!("-> Skipping {} due to error", item);
    false
}

struct PreparedVm {
    record: VmRecord,
    dir: PathBuf,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs backup batches one item at a time
pub struct BackupOrchestrator {
    config: BackupConfig,
    hypervisor: HypervisorRef,
    space: SpaceProbeRef,
}

impl BackupOrchestrator {
    pub fn new(config: BackupConfig, hypervisor: HypervisorRef, space: SpaceProbeRef) -> Self {
        Self {
            config,
            hypervisor,
            space,
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Fetch the pool's VM names
    pub async fn gather_inventory(&self) -> Result<Inventory> {
        info!("**** GET ALL VMS ****");
        let names = self
            .hypervisor
            .list_vm_names()
            .await
            .map_err(|e| Error::InventoryUnavailable(e.to_string()))?;

        let inventory = Inventory::new(names);
        if inventory.is_empty() {
            error!("(!) No VMs found in pool");
            info!(">> Error <<");
            return Err(Error::InventoryUnavailable(
                "no VMs found in pool".to_string(),
            ));
        }

        debug!("(i) VMs in pool: {}", inventory.names().join(", "));
        info!(">> Success <<");
        Ok(inventory)
    }

    /// Resolve the configured lists against an inventory
    pub fn select(&self, inventory: Inventory) -> Selections {
        Selections::resolve(
            inventory,
            &self.config.excludes,
            &self.config.vdi_exports,
            &self.config.vm_exports,
        )
    }

    /// Execute every enabled batch in order
    pub async fn run_all(&self, selections: &Selections) -> RunReport {
        let mut report = RunReport::default();

        if self.config.host_backup {
            report.hosts = Some(self.run_host_backup().await);
        }
        if self.config.pool_backup {
            report.pool_db = Some(self.run_pool_db_backup().await);
        }
        if !selections.disk_exports.is_empty() {
            let jobs = BackupJob::from_selection(
                &selections.disk_exports,
                BackupMode::DiskExport,
                self.config.max_backups,
            );
            report.disk_export = Some(self.run_disk_export(&jobs).await);
        }
        if !selections.full_exports.is_empty() {
            let jobs = BackupJob::from_selection(
                &selections.full_exports,
                BackupMode::FullExport,
                self.config.max_backups,
            );
            report.full_export = Some(self.run_full_export(&jobs).await);
        }

        report
    }

    // =========================================================================
    // Pool-level Backups
    // =========================================================================

    /// Back up the dom0 of every enabled host
    pub async fn run_host_backup(&self) -> BatchSummary {
        info!("************************");
        info!("** HOST(dom0) BACKUP **");
        let mut summary = BatchSummary::new();

        let date = artifacts::date_token(&Local::now());
        let file = artifacts::hosts_backup_file(&self.config.backup_dir, &date);
        match self.pool_backup("backup hosts", &file, false).await {
            Ok(()) => {
                info!("> Hosts backed up to {}", file.display());
                summary.record_success();
            }
            Err(e) => {
                error!("(!) Failed to backup hosts: {}", e);
                summary.record_error();
            }
        }

        info!("{}", summary.outcome());
        summary
    }

    /// Dump the pool database
    pub async fn run_pool_db_backup(&self) -> BatchSummary {
        info!("************************");
        info!("** POOL DATABASE BACKUP **");
        let mut summary = BatchSummary::new();

        let date = artifacts::date_token(&Local::now());
        let file = artifacts::pool_db_backup_file(&self.config.backup_dir, &date);
        match self.pool_backup("backup the pool database", &file, true).await {
            Ok(()) => {
                info!("> Pool database backed up to {}", file.display());
                summary.record_success();
            }
            Err(e) => {
                error!("(!) Failed to backup pool database: {}", e);
                summary.record_error();
            }
        }

        info!("{}", summary.outcome());
        summary
    }

    async fn pool_backup(&self, operation: &str, file: &Path, database: bool) -> Result<()> {
        if !self.hypervisor.is_pool_master().await? {
            return Err(Error::NotPoolMaster {
                operation: operation.to_string(),
            });
        }
        if let Some(parent) = file.parent() {
            artifacts::ensure_dir(parent).await?;
        }
        if database {
            self.hypervisor.backup_pool_database(file).await
        } else {
            self.hypervisor.backup_hosts(file, true).await
        }
    }

    // =========================================================================
    // VM Batches
    // =========================================================================

    /// Export the selected disks of each VM
    pub async fn run_disk_export(&self, jobs: &[BackupJob]) -> BatchSummary {
        let begin = Local::now();
        info!("************************");
        info!("** VDI-EXPORT ({})", artifacts::time_string(&begin));
        let mut summary = BatchSummary::new();

        if jobs.is_empty() {
            warn!("(!) No VMs selected for vdi-export");
            summary.record_warning();
        }

        'jobs: for job in jobs {
            let vm_start = Local::now();
            info!("{} started at {}", job.vm_name, artifacts::time_string(&vm_start));
            debug!(
                "(i) Name:{} Max-Backups:{} Disks:{:?}",
                job.vm_name, job.max_backups, job.disks
            );

            let vm = match self.prepare_disk_job(job).await {
                Ok(vm) => vm,
                Err(e) => {
                    if record_failure(&mut summary, &e, &job.vm_name) {
                        break;
                    }
                    continue;
                }
            };

            for disk in &job.disks {
                let disk_start = Local::now();
                info!("* {} started at {}", disk, artifacts::time_string(&disk_start));

                let mut rollback = Rollback::new(self.hypervisor.as_ref());
                match self
                    .export_disk(job, &vm, disk, &mut rollback, &mut summary)
                    .await
                {
                    Ok(data_file) => {
                        summary.record_success();
                        let end = Local::now();
                        info!(
                            "* {} completed at {} - time:{} size:{}",
                            disk,
                            artifacts::time_string(&end),
                            artifacts::format_elapsed(&disk_start, &end),
                            artifacts::file_size_string(&data_file).await
                        );
                    }
                    Err(e) => {
                        rollback.unwind().await;
                        if record_failure(&mut summary, &e, disk) {
                            break 'jobs;
                        }
                    }
                }
            }

            let end = Local::now();
            info!(
                "{} completed at {} - time:{}",
                job.vm_name,
                artifacts::time_string(&end),
                artifacts::format_elapsed(&vm_start, &end)
            );
        }

        let end = Local::now();
        info!(
            "** VDI-EXPORT completed at {} - time:{}",
            artifacts::time_string(&end),
            artifacts::format_elapsed(&begin, &end)
        );
        summary.log();
        summary
    }

    /// Export each VM as a whole
    pub async fn run_full_export(&self, jobs: &[BackupJob]) -> BatchSummary {
        let begin = Local::now();
        info!("************************");
        info!("** VM-EXPORT ({})", artifacts::time_string(&begin));
        let mut summary = BatchSummary::new();

        if jobs.is_empty() {
            warn!("(!) No VMs selected for vm-export");
            summary.record_warning();
        }

        for job in jobs {
            let vm_start = Local::now();
            info!("{} started at {}", job.vm_name, artifacts::time_string(&vm_start));
            debug!("(i) Name:{} Max-Backups:{}", job.vm_name, job.max_backups);

            let mut rollback = Rollback::new(self.hypervisor.as_ref());
            match self.export_vm(job, &mut rollback, &mut summary).await {
                Ok(data_file) => {
                    summary.record_success();
                    let end = Local::now();
                    info!(
                        "{} completed at {} - time:{} size:{}",
                        job.vm_name,
                        artifacts::time_string(&end),
                        artifacts::format_elapsed(&vm_start, &end),
                        artifacts::file_size_string(&data_file).await
                    );
                }
                Err(e) => {
                    rollback.unwind().await;
                    if record_failure(&mut summary, &e, &job.vm_name) {
                        break;
                    }
                }
            }
        }

        let end = Local::now();
        info!(
            "** VM-EXPORT completed at {} - time:{}",
            artifacts::time_string(&end),
            artifacts::format_elapsed(&begin, &end)
        );
        summary.log();
        summary
    }

    // =========================================================================
    // Work Items
    // =========================================================================

    #[instrument(skip_all, fields(vm = %job.vm_name))]
    async fn export_vm(
        &self,
        job: &BackupJob,
        rollback: &mut Rollback<'_>,
        summary: &mut BatchSummary,
    ) -> Result<PathBuf> {
        self.check_space()?;
        let vm = self.prepare_vm(&job.vm_name).await?;

        let date = artifacts::date_token(&Local::now());
        let set = ArtifactSet::full_export(&vm.dir, &date, self.config.compress);
        let label = artifacts::vm_snapshot_label(&job.vm_name);
        debug!("(i) Backup files: {:?} {:?}", set.meta_file, set.data_file);

        info!("-> Backing up VM metadata");
        rollback.track_meta(&set.meta_file);
        capture_metadata(self.hypervisor.as_ref(), &vm.record, &set.meta_file)
            .await
            .map_err(|e| Error::MetadataCapture {
                vm: job.vm_name.clone(),
                reason: e.to_string(),
            })?;

        self.clear_stale_snapshot(&label, SnapshotKind::Vm, summary)
            .await;

        info!("-> Taking snapshot of VM");
        let snapshot = self
            .hypervisor
            .snapshot_vm(&vm.record.uuid, &label)
            .await
            .map_err(|e| {
                debug!("(i) Snapshot failed: {}", e);
                Error::SnapshotCreate {
                    label: label.clone(),
                }
            })?;
        rollback.track_snapshot(&snapshot, SnapshotKind::Vm, &label);

        info!("-> Setting snapshot parameters");
        self.hypervisor
            .prepare_vm_snapshot_for_export(&snapshot)
            .await
            .map_err(|e| {
                debug!("(i) Prepare failed: {}", e);
                Error::SnapshotPrepare {
                    label: label.clone(),
                }
            })?;

        info!("-> Exporting VM");
        rollback.track_data(&set.data_file);
        self.hypervisor
            .export_vm(&snapshot, &set.data_file, self.config.compress)
            .await
            .map_err(|e| {
                debug!("(i) Export failed: {}", e);
                Error::Export {
                    label: label.clone(),
                    path: set.data_file.clone(),
                }
            })?;

        self.finish_item(
            rollback,
            &vm.dir,
            &ArtifactFamily::FullExport,
            job.max_backups,
            summary,
        )
        .await;
        Ok(set.data_file)
    }

    #[instrument(skip_all, fields(vm = %job.vm_name, disk = %disk))]
    async fn export_disk(
        &self,
        job: &BackupJob,
        vm: &PreparedVm,
        disk: &str,
        rollback: &mut Rollback<'_>,
        summary: &mut BatchSummary,
    ) -> Result<PathBuf> {
        self.check_space()?;

        let date = artifacts::date_token(&Local::now());
        let format = self.config.vdi_export_format;
        let set = ArtifactSet::disk_export(&vm.dir, disk, &date, format);
        let label = artifacts::disk_snapshot_label(&job.vm_name, disk);
        debug!("(i) Backup files: {:?} {:?}", set.meta_file, set.data_file);

        info!("-> Backing up VM metadata");
        rollback.track_meta(&set.meta_file);
        let devices = capture_metadata(self.hypervisor.as_ref(), &vm.record, &set.meta_file)
            .await
            .map_err(|e| Error::MetadataCapture {
                vm: job.vm_name.clone(),
                reason: e.to_string(),
            })?;

        self.clear_stale_snapshot(&label, SnapshotKind::Vdi, summary)
            .await;

        let vdi = devices.get(disk).ok_or_else(|| Error::InvalidDevice {
            vm: job.vm_name.clone(),
            device: disk.to_string(),
        })?;

        info!("-> Taking snapshot of disk {}", disk);
        let snapshot = self.hypervisor.snapshot_vdi(vdi).await.map_err(|e| {
            debug!("(i) Snapshot failed: {}", e);
            Error::SnapshotCreate {
                label: label.clone(),
            }
        })?;
        rollback.track_snapshot(&snapshot, SnapshotKind::Vdi, &label);

        info!("-> Setting snapshot parameters");
        self.hypervisor
            .tag_vdi(&snapshot, &label)
            .await
            .map_err(|e| {
                debug!("(i) Tagging failed: {}", e);
                Error::SnapshotPrepare {
                    label: label.clone(),
                }
            })?;

        info!("-> Exporting disk {}", disk);
        rollback.track_data(&set.data_file);
        self.hypervisor
            .export_vdi(&snapshot, &set.data_file, format)
            .await
            .map_err(|e| {
                debug!("(i) Export failed: {}", e);
                Error::Export {
                    label: label.clone(),
                    path: set.data_file.clone(),
                }
            })?;

        self.finish_item(
            rollback,
            &vm.dir,
            &ArtifactFamily::DiskExport(disk.to_string()),
            job.max_backups,
            summary,
        )
        .await;
        Ok(set.data_file)
    }

    async fn prepare_disk_job(&self, job: &BackupJob) -> Result<PreparedVm> {
        self.check_space()?;
        if job.disks.is_empty() {
            return Err(Error::NoDisksSelected {
                name: job.vm_name.clone(),
            });
        }
        self.prepare_vm(&job.vm_name).await
    }

    /// Resolve the VM, create its directory and load its record
    async fn prepare_vm(&self, vm_name: &str) -> Result<PreparedVm> {
        let vm = match self.hypervisor.get_vm(vm_name).await {
            Ok(Some(vm)) => vm,
            Ok(None) => {
                return Err(Error::VmNotFound {
                    name: vm_name.to_string(),
                })
            }
            Err(e @ Error::AmbiguousVm { .. }) => return Err(e),
            Err(e) => {
                debug!("(i) VM lookup failed: {}", e);
                return Err(Error::VmNotFound {
                    name: vm_name.to_string(),
                });
            }
        };

        let dir = self.config.backup_dir.join(vm_name);
        artifacts::ensure_dir(&dir).await?;

        let record = self
            .hypervisor
            .get_vm_record(&vm)
            .await
            .map_err(|e| Error::MetadataCapture {
                vm: vm_name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(PreparedVm { record, dir })
    }

    fn check_space(&self) -> Result<()> {
        let remaining = match self.space.remaining_percent(&self.config.backup_dir) {
            Ok(remaining) => remaining,
            Err(e) => {
                warn!("(!) Unable to determine backup space, assuming none: {}", e);
                0
            }
        };
        debug!(
            "(i) Space remaining: {}% (threshold {}%)",
            remaining, self.config.space_threshold
        );

        if remaining < self.config.space_threshold {
            return Err(Error::SpaceThresholdExceeded {
                remaining,
                threshold: self.config.space_threshold,
            });
        }
        Ok(())
    }

    /// Destroy a snapshot an interrupted run left under `label`
    async fn clear_stale_snapshot(
        &self,
        label: &str,
        kind: SnapshotKind,
        summary: &mut BatchSummary,
    ) {
        let stale = match self.hypervisor.find_snapshot_by_label(label, kind).await {
            Ok(Some(uuid)) => uuid,
            Ok(None) => return,
            Err(e) => {
                warn!("(!) Unable to check for previous snapshot {}: {}", label, e);
                summary.record_warning();
                return;
            }
        };

        warn!("(!) Found snapshot from a previous run: {}", label);
        match destroy_snapshot(self.hypervisor.as_ref(), &stale, kind).await {
            Ok(()) => info!("-> Removed previous snapshot {}", stale),
            Err(e) => {
                warn!("(!) Failed to remove previous snapshot {}: {}", stale, e);
                summary.record_warning();
            }
        }
    }

    /// Destroy the committed snapshot and rotate the family's artifacts
    async fn finish_item(
        &self,
        rollback: &mut Rollback<'_>,
        dir: &Path,
        family: &ArtifactFamily,
        max_backups: u32,
        summary: &mut BatchSummary,
    ) {
        if let Some(snap) = rollback.commit() {
            info!("-> Destroying snapshot {}", snap.label);
            if let Err(e) = destroy_snapshot(self.hypervisor.as_ref(), &snap.uuid, snap.kind).await
            {
                debug!("(i) Destroy failed: {}", e);
                let err = Error::Cleanup { label: snap.label };
                warn!("(!) {}", err);
                summary.record(&err);
            }
        }

        info!("-> Rotating backups, keeping {}", max_backups);
        match rotation::rotate_family(max_backups, dir, family).await {
            Ok(removed) if removed > 0 => debug!("(i) Removed {} old backups", removed),
            Ok(_) => {}
            Err(e) => {
                warn!("(!) {}", e);
                summary.record_warning();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::space::ScriptedSpaceProbe;
    use crate::domain::ports::VdiExportFormat;
    use crate::hypervisor::{MockBackend, MockOp};
    use crate::selection::SelectionMatch;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        mock: Arc<MockBackend>,
        backup_dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let backup_dir = tmp.path().to_path_buf();
            Self {
                _tmp: tmp,
                mock: Arc::new(MockBackend::new()),
                backup_dir,
            }
        }

        fn vm(&self, name: &str, disks: &[&str]) -> String {
            let vm = self.mock.add_vm(name);
            for disk in disks {
                self.mock.add_disk(&vm, disk);
            }
            self.mock.add_vif(&vm, "0", "Pool-wide network");
            vm
        }

        fn orchestrator(&self, probe: ScriptedSpaceProbe) -> BackupOrchestrator {
            let config = BackupConfig {
                backup_dir: self.backup_dir.clone(),
                max_backups: 4,
                ..Default::default()
            };
            BackupOrchestrator::new(config, self.mock.clone(), Arc::new(probe))
        }

        fn files(&self, vm: &str) -> Vec<String> {
            let dir = self.backup_dir.join(vm);
            if !dir.is_dir() {
                return Vec::new();
            }
            let mut names: Vec<String> = std::fs::read_dir(dir)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }
    }

    fn full(name: &str) -> BackupJob {
        BackupJob {
            vm_name: name.to_string(),
            mode: BackupMode::FullExport,
            max_backups: 4,
            disks: Vec::new(),
        }
    }

    fn disks(name: &str, disks: &[&str]) -> BackupJob {
        BackupJob {
            vm_name: name.to_string(),
            mode: BackupMode::DiskExport,
            max_backups: 4,
            disks: disks.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn counts(s: &BatchSummary) -> (u32, u32, u32) {
        (s.success, s.warning, s.error)
    }

    #[tokio::test]
    async fn test_full_export_success() {
        let fx = Fixture::new();
        fx.vm("web1", &["xvda"]);
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));

        let summary = orch.run_full_export(&[full("web1")]).await;
        assert_eq!(counts(&summary), (1, 0, 0));

        let files = fx.files("web1");
        assert_eq!(files.len(), 2);
        assert!(files[0].starts_with("backup_") && files[0].ends_with(".meta"));
        assert!(files[1].ends_with(".xva"));
        assert!(fx.mock.snapshot_labels().is_empty());
    }

    #[tokio::test]
    async fn test_compressed_export_extension() {
        let fx = Fixture::new();
        fx.vm("web1", &["xvda"]);
        let config = BackupConfig {
            backup_dir: fx.backup_dir.clone(),
            compress: true,
            ..Default::default()
        };
        let orch = BackupOrchestrator::new(
            config,
            fx.mock.clone(),
            Arc::new(ScriptedSpaceProbe::fixed(80)),
        );

        orch.run_full_export(&[full("web1")]).await;
        assert!(fx.files("web1").iter().any(|f| f.ends_with(".xva.gz")));
    }

    #[tokio::test]
    async fn test_missing_and_ambiguous_vms_are_skipped() {
        let fx = Fixture::new();
        fx.vm("dup", &["xvda"]);
        fx.vm("dup", &["xvda"]);
        fx.vm("web1", &["xvda"]);
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));

        let summary = orch
            .run_full_export(&[full("dup"), full("ghost"), full("web1")])
            .await;
        assert_eq!(counts(&summary), (1, 0, 2));
        assert!(fx.files("dup").is_empty());
        assert_eq!(fx.files("web1").len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_failure_removes_metadata() {
        let fx = Fixture::new();
        fx.vm("web1", &["xvda"]);
        fx.mock.fail(MockOp::SnapshotVm);
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));

        let summary = orch.run_full_export(&[full("web1")]).await;
        assert_eq!(counts(&summary), (0, 0, 1));
        assert!(fx.files("web1").is_empty());
    }

    #[tokio::test]
    async fn test_export_failure_rolls_back_snapshot() {
        let fx = Fixture::new();
        fx.vm("web1", &["xvda"]);
        fx.vm("web2", &["xvda"]);
        fx.mock.fail(MockOp::ExportVm);
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));

        let summary = orch.run_full_export(&[full("web1"), full("web2")]).await;
        assert_eq!(counts(&summary), (0, 0, 2));
        assert!(fx.mock.snapshot_labels().is_empty());
        assert!(fx.files("web1").is_empty());
        assert_eq!(fx.mock.attempts(MockOp::ExportVm), 2);
    }

    #[tokio::test]
    async fn test_partial_vm_export_is_removed() {
        let fx = Fixture::new();
        fx.vm("web1", &["xvda"]);
        fx.mock.fail_after_write(MockOp::ExportVm);
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));

        let summary = orch.run_full_export(&[full("web1")]).await;
        assert_eq!(counts(&summary), (0, 0, 1));
        assert_eq!(fx.mock.attempts(MockOp::ExportVm), 1);
        assert!(fx.files("web1").is_empty());
        assert!(fx.mock.snapshot_labels().is_empty());
    }

    #[tokio::test]
    async fn test_partial_disk_export_is_removed() {
        let fx = Fixture::new();
        fx.vm("db1", &["xvda", "xvdb"]);
        fx.mock.fail_after_write(MockOp::ExportVdi);
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));

        let summary = orch.run_disk_export(&[disks("db1", &["xvda", "xvdb"])]).await;
        assert_eq!(counts(&summary), (0, 0, 2));
        assert_eq!(fx.mock.attempts(MockOp::ExportVdi), 2);
        assert!(fx.files("db1").is_empty());
        assert!(fx.mock.snapshot_labels().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_failure_rolls_back_snapshot() {
        let fx = Fixture::new();
        fx.vm("web1", &["xvda"]);
        fx.mock.fail(MockOp::PrepareSnapshot);
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));

        let summary = orch.run_full_export(&[full("web1")]).await;
        assert_eq!(counts(&summary), (0, 0, 1));
        assert!(fx.mock.snapshot_labels().is_empty());
        assert!(fx.files("web1").is_empty());
    }

    #[tokio::test]
    async fn test_invalid_disk_does_not_block_others() {
        let fx = Fixture::new();
        fx.vm("db1", &["xvda"]);
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));

        let summary = orch.run_disk_export(&[disks("db1", &["xvda", "xvdb"])]).await;
        assert_eq!(counts(&summary), (1, 0, 1));

        let files = fx.files("db1");
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.starts_with("backup_xvda_")));
        assert!(files.iter().any(|f| f.ends_with(".raw")));
    }

    #[tokio::test]
    async fn test_disk_export_vhd_format() {
        let fx = Fixture::new();
        fx.vm("db1", &["xvda", "xvdb"]);
        let config = BackupConfig {
            backup_dir: fx.backup_dir.clone(),
            vdi_export_format: VdiExportFormat::Vhd,
            ..Default::default()
        };
        let orch = BackupOrchestrator::new(
            config,
            fx.mock.clone(),
            Arc::new(ScriptedSpaceProbe::fixed(80)),
        );

        let summary = orch.run_disk_export(&[disks("db1", &["xvda", "xvdb"])]).await;
        assert_eq!(counts(&summary), (2, 0, 0));
        assert_eq!(fx.files("db1").iter().filter(|f| f.ends_with(".vhd")).count(), 2);
        assert!(fx.mock.snapshot_labels().is_empty());
    }

    #[tokio::test]
    async fn test_tag_failure_rolls_back_vdi_snapshot() {
        let fx = Fixture::new();
        fx.vm("db1", &["xvda"]);
        fx.mock.fail(MockOp::TagVdi);
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));

        let summary = orch.run_disk_export(&[disks("db1", &["xvda"])]).await;
        assert_eq!(counts(&summary), (0, 0, 1));
        assert!(fx.mock.snapshot_labels().is_empty());
        assert!(fx.files("db1").is_empty());
    }

    #[tokio::test]
    async fn test_disk_job_without_disks() {
        let fx = Fixture::new();
        fx.vm("db1", &["xvda"]);
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));

        let summary = orch.run_disk_export(&[disks("db1", &[])]).await;
        assert_eq!(counts(&summary), (0, 0, 1));
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_replaced() {
        let fx = Fixture::new();
        fx.vm("web1", &["xvda"]);
        fx.mock.add_stale_snapshot("VMBACKUP_web1", SnapshotKind::Vm);
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));

        let summary = orch.run_full_export(&[full("web1")]).await;
        assert_eq!(counts(&summary), (1, 0, 0));
        assert!(fx.mock.snapshot_labels().is_empty());
        assert_eq!(fx.mock.attempts(MockOp::DestroySnapshot), 2);
    }

    #[tokio::test]
    async fn test_stale_disk_snapshot_is_replaced() {
        let fx = Fixture::new();
        fx.vm("db1", &["xvda"]);
        fx.mock.add_stale_snapshot("VMBACKUP_db1_xvda", SnapshotKind::Vdi);
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));

        let summary = orch.run_disk_export(&[disks("db1", &["xvda"])]).await;
        assert_eq!(counts(&summary), (1, 0, 0));
        assert_eq!(fx.mock.attempts(MockOp::DestroyVdi), 2);
        assert!(fx.mock.snapshot_labels().is_empty());
        assert_eq!(fx.files("db1").len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_failures_are_warnings() {
        let fx = Fixture::new();
        fx.vm("web1", &["xvda"]);
        fx.mock.add_stale_snapshot("VMBACKUP_web1", SnapshotKind::Vm);
        fx.mock.fail(MockOp::DestroySnapshot);
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));

        let summary = orch.run_full_export(&[full("web1")]).await;
        // Stale snapshot and fresh snapshot both survive
        assert_eq!(counts(&summary), (1, 2, 0));
        assert_eq!(fx.files("web1").len(), 2);
        assert_eq!(fx.mock.snapshot_labels().len(), 2);
    }

    #[tokio::test]
    async fn test_space_threshold_aborts_batch() {
        let fx = Fixture::new();
        for name in ["a", "b", "c"] {
            fx.vm(name, &["xvda"]);
        }
        let orch = fx.orchestrator(ScriptedSpaceProbe::sequence([80, 5]));

        let summary = orch
            .run_full_export(&[full("a"), full("b"), full("c")])
            .await;
        assert_eq!(counts(&summary), (1, 0, 1));
        assert_eq!(fx.files("a").len(), 2);
        assert!(fx.files("b").is_empty());
        assert!(fx.files("c").is_empty());
        assert_eq!(fx.mock.attempts(MockOp::SnapshotVm), 1);
    }

    #[tokio::test]
    async fn test_space_threshold_between_disks() {
        let fx = Fixture::new();
        fx.vm("db1", &["xvda", "xvdb"]);
        fx.vm("db2", &["xvda"]);
        // One reading for the VM, then one per disk
        let orch = fx.orchestrator(ScriptedSpaceProbe::sequence([80, 80, 5]));

        let summary = orch
            .run_disk_export(&[disks("db1", &["xvda", "xvdb"]), disks("db2", &["xvda"])])
            .await;
        assert_eq!(counts(&summary), (1, 0, 1));
        assert_eq!(fx.files("db1").len(), 2);
        assert!(fx.files("db2").is_empty());
    }

    #[tokio::test]
    async fn test_low_space_aborts_disk_export_before_vm_lookup() {
        let fx = Fixture::new();
        fx.vm("db1", &["xvda"]);
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(5));

        let summary = orch
            .run_disk_export(&[disks("ghost", &["xvda"]), disks("db1", &["xvda"])])
            .await;
        assert_eq!(counts(&summary), (0, 0, 1));
        assert!(!fx.backup_dir.join("ghost").exists());
        assert!(!fx.backup_dir.join("db1").exists());
        assert_eq!(fx.mock.attempts(MockOp::GetVmRecord), 0);
    }

    #[tokio::test]
    async fn test_rotation_after_export() {
        let fx = Fixture::new();
        fx.vm("web1", &["xvda"]);
        let vm_dir = fx.backup_dir.join("web1");
        std::fs::create_dir_all(&vm_dir).unwrap();

        let base = SystemTime::now() - Duration::from_secs(100_000);
        for i in 0..3u64 {
            for ext in ["meta", "xva"] {
                let path = vm_dir.join(format!("backup_0101201{}-000000.{}", i, ext));
                let file = std::fs::File::create(path).unwrap();
                file.set_modified(base + Duration::from_secs(i * 100)).unwrap();
            }
        }

        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));
        let mut job = full("web1");
        job.max_backups = 2;
        let summary = orch.run_full_export(&[job]).await;
        assert_eq!(counts(&summary), (1, 0, 0));

        let files = fx.files("web1");
        assert_eq!(files.len(), 4);
        assert!(!files.iter().any(|f| f.starts_with("backup_01012010")));
        assert!(!files.iter().any(|f| f.starts_with("backup_01012011")));
        assert!(files.iter().any(|f| f.starts_with("backup_01012012")));
    }

    #[tokio::test]
    async fn test_orphaned_file_is_a_warning() {
        let fx = Fixture::new();
        fx.vm("web1", &["xvda"]);
        let vm_dir = fx.backup_dir.join("web1");
        std::fs::create_dir_all(&vm_dir).unwrap();
        std::fs::write(vm_dir.join("backup_01012010-000000.meta"), b"orphan").unwrap();

        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));
        let summary = orch.run_full_export(&[full("web1")]).await;
        assert_eq!(counts(&summary), (1, 1, 0));
        assert_eq!(fx.files("web1").len(), 3);
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_warning() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));

        let summary = orch.run_disk_export(&[]).await;
        assert_eq!(counts(&summary), (0, 1, 0));
    }

    #[tokio::test]
    async fn test_pool_backups_require_master() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));

        assert_eq!(counts(&orch.run_host_backup().await), (1, 0, 0));
        assert_eq!(counts(&orch.run_pool_db_backup().await), (1, 0, 0));
        assert_eq!(fx.files(artifacts::HOSTS_DIR).len(), 1);
        assert_eq!(fx.files(artifacts::POOL_DB_DIR).len(), 1);

        fx.mock.set_pool_master(false);
        assert_eq!(counts(&orch.run_host_backup().await), (0, 0, 1));
        assert_eq!(counts(&orch.run_pool_db_backup().await), (0, 0, 1));
    }

    #[tokio::test]
    async fn test_run_all_end_to_end() {
        let fx = Fixture::new();
        for name in ["web1", "web2", "db1", "test1"] {
            fx.vm(name, &["xvda"]);
        }
        let config = BackupConfig {
            backup_dir: fx.backup_dir.clone(),
            excludes: vec!["test.*".to_string()],
            vdi_exports: vec!["db1:2".to_string()],
            vm_exports: vec![".*".to_string()],
            host_backup: true,
            ..Default::default()
        };
        let orch = BackupOrchestrator::new(
            config,
            fx.mock.clone(),
            Arc::new(ScriptedSpaceProbe::fixed(80)),
        );

        let inventory = orch.gather_inventory().await.unwrap();
        let selections = orch.select(inventory);
        assert_eq!(selections.excludes.vm_names(), vec!["test1"]);
        assert_eq!(
            selections.disk_exports.iter().collect::<Vec<_>>(),
            vec![&SelectionMatch {
                vm_name: "db1".into(),
                max_backups: Some(2),
                disks: None,
            }]
        );
        assert_eq!(selections.full_exports.vm_names(), vec!["web1", "web2"]);

        let report = orch.run_all(&selections).await;
        assert_eq!(report.hosts.map(|s| s.success), Some(1));
        assert_eq!(report.pool_db, None);
        assert_eq!(report.disk_export.map(|s| s.success), Some(1));
        assert_eq!(report.full_export.map(|s| s.success), Some(2));
        assert_eq!(report.error_count(), 0);
        assert!(fx.files("test1").is_empty());
        assert!(fx.files("db1").iter().all(|f| f.starts_with("backup_xvda_")));
    }

    #[tokio::test]
    async fn test_inventory_failure() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(ScriptedSpaceProbe::fixed(80));
        assert!(matches!(
            orch.gather_inventory().await,
            Err(Error::InventoryUnavailable(_))
        ));

        fx.vm("web1", &[]);
        fx.mock.fail(MockOp::ListVms);
        assert!(matches!(
            orch.gather_inventory().await,
            Err(Error::InventoryUnavailable(_))
        ));
    }
}

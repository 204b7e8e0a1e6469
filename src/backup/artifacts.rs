//! Backup Artifacts
//!
//! Naming of backup files, snapshot tags and the date tokens embedded in
//! them. A backup of a VM or disk is always an [`ArtifactSet`]: a metadata
//! file and a data file sharing one timestamped base name.

use crate::domain::ports::VdiExportFormat;
use crate::error::{Error, Result};
use chrono::{DateTime, Local, TimeZone};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error};

/// Prefix of every snapshot created by a backup run
pub const SNAPSHOT_PREFIX: &str = "VMBACKUP";

/// Directory under `backup_dir` for host backups
pub const HOSTS_DIR: &str = "HOSTS";

/// Directory under `backup_dir` for pool database dumps
pub const POOL_DB_DIR: &str = "POOL_DB";

// =============================================================================
// Date Tokens
// =============================================================================

/// File name date token, `MMDDYYYY-HHMMSS`
pub fn date_token<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format("%m%d%Y-%H%M%S").to_string()
}

/// Human readable timestamp for run banners
pub fn date_string(at: &DateTime<Local>) -> String {
    at.format("%m/%d/%Y %H:%M:%S").to_string()
}

/// Wall clock time for progress lines
pub fn time_string(at: &DateTime<Local>) -> String {
    at.format("%H:%M:%S").to_string()
}

/// Render an elapsed time in its largest whole unit (`42s`, `3m`, `2h`, `1d`)
pub fn format_elapsed(start: &DateTime<Local>, end: &DateTime<Local>) -> String {
    let secs = (*end - *start).num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3_600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3_600),
        s => format!("{}d", s / 86_400),
    }
}

/// Size of a file in GiB, for completion lines
pub async fn file_size_string(path: &Path) -> String {
    match fs::metadata(path).await {
        Ok(meta) => format!("{:.2}G", meta.len() as f64 / (1024.0 * 1024.0 * 1024.0)),
        Err(e) => {
            debug!("(!) Unable to get file size of {:?}: {}", path, e);
            "unknown".to_string()
        }
    }
}

// =============================================================================
// Snapshot Tags
// =============================================================================

/// Tag of the snapshot taken for a full VM export
pub fn vm_snapshot_label(vm_name: &str) -> String {
    format!("{}_{}", SNAPSHOT_PREFIX, vm_name)
}

/// Tag of the snapshot taken for a single disk export
pub fn disk_snapshot_label(vm_name: &str, disk: &str) -> String {
    format!("{}_{}_{}", SNAPSHOT_PREFIX, vm_name, disk)
}

// =============================================================================
// Artifact Set
// =============================================================================

/// Metadata file plus data file of one backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    pub meta_file: PathBuf,
    pub data_file: PathBuf,
}

impl ArtifactSet {
    /// `backup_<date>.meta` + `backup_<date>.xva[.gz]`
    pub fn full_export(vm_dir: &Path, date: &str, compress: bool) -> Self {
        let base = format!("backup_{}", date);
        let extension = if compress { "xva.gz" } else { "xva" };
        Self {
            meta_file: vm_dir.join(format!("{}.meta", base)),
            data_file: vm_dir.join(format!("{}.{}", base, extension)),
        }
    }

    /// `backup_<disk>_<date>.meta` + `backup_<disk>_<date>.<raw|vhd>`
    pub fn disk_export(vm_dir: &Path, disk: &str, date: &str, format: VdiExportFormat) -> Self {
        let base = format!("backup_{}_{}", disk, date);
        Self {
            meta_file: vm_dir.join(format!("{}.meta", base)),
            data_file: vm_dir.join(format!("{}.{}", base, format.extension())),
        }
    }
}

/// `backup_dir/HOSTS/hosts_<date>.xbk`
pub fn hosts_backup_file(backup_dir: &Path, date: &str) -> PathBuf {
    backup_dir.join(HOSTS_DIR).join(format!("hosts_{}.xbk", date))
}

/// `backup_dir/POOL_DB/metadata_<date>.db`
pub fn pool_db_backup_file(backup_dir: &Path, date: &str) -> PathBuf {
    backup_dir.join(POOL_DB_DIR).join(format!("metadata_{}.db", date))
}

// =============================================================================
// Artifact Families
// =============================================================================

/// The files of one retention unit inside a VM directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactFamily {
    /// Full exports of the VM
    FullExport,
    /// Exports of one disk of the VM
    DiskExport(String),
}

impl ArtifactFamily {
    /// Check whether a file name belongs to this family
    pub fn matches(&self, file_name: &str) -> bool {
        let rest = match self {
            ArtifactFamily::FullExport => file_name.strip_prefix("backup_"),
            ArtifactFamily::DiskExport(disk) => file_name
                .strip_prefix("backup_")
                .and_then(|r| r.strip_prefix(disk.as_str()))
                .and_then(|r| r.strip_prefix('_')),
        };
        // The date token always follows directly
        rest.and_then(|r| r.chars().next())
            .map_or(false, |c| c.is_ascii_digit())
    }
}

// =============================================================================
// Filesystem Helpers
// =============================================================================

/// Create a backup directory if it does not exist
pub async fn ensure_dir(path: &Path) -> Result<()> {
    if fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false) {
        return Ok(());
    }
    fs::create_dir_all(path)
        .await
        .map_err(|e| Error::DirectoryCreate {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Delete a file if present, logging a failure
pub async fn remove_artifact(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(_) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("(i) File does not exist: {:?}", path);
            true
        }
        Err(e) => {
            error!("(!) Unable to delete file {:?}: {}", path, e);
            false
        }
    }
}

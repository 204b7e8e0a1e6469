//! Error types for VmBackup
//!
//! Provides structured error types for selection, configuration, the
//! hypervisor port and every step of the backup workflow. Each workflow
//! error carries a [`Disposition`] that tells the orchestrator whether the
//! failure ends the batch, skips the current item, or is only a warning.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for VmBackup
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Inventory & Selection Errors
    // =========================================================================
    #[error("Unable to enumerate VM inventory: {0}")]
    InventoryUnavailable(String),

    #[error("Invalid selection pattern: {pattern}")]
    InvalidPattern { pattern: String },

    #[error("max_backups override invalid for {entry}: {reason}")]
    InvalidRetention { entry: String, reason: String },

    // =========================================================================
    // Hypervisor Errors
    // =========================================================================
    #[error("Hypervisor command failed: {command} - {reason}")]
    HypervisorCommand { command: String, reason: String },

    #[error("Record not found: {kind}/{id}")]
    RecordNotFound { kind: String, id: String },

    #[error("Must be run on the pool master to {operation}")]
    NotPoolMaster { operation: String },

    // =========================================================================
    // Backup Workflow Errors
    // =========================================================================
    #[error("Space remaining is below threshold: {remaining}% < {threshold}%")]
    SpaceThresholdExceeded { remaining: u8, threshold: u8 },

    #[error("No valid VM found: {name}")]
    VmNotFound { name: String },

    #[error("More than one VM exists with same name: {name}")]
    AmbiguousVm { name: String },

    #[error("No disks selected for backup: {name}")]
    NoDisksSelected { name: String },

    #[error("Unable to create backup directory {path:?}: {reason}")]
    DirectoryCreate { path: PathBuf, reason: String },

    #[error("Failed to capture metadata for {vm}: {reason}")]
    MetadataCapture { vm: String, reason: String },

    #[error("Invalid device specified for {vm}: {device}")]
    InvalidDevice { vm: String, device: String },

    #[error("Failed to create snapshot: {label}")]
    SnapshotCreate { label: String },

    #[error("Failed to prepare snapshot for backup: {label}")]
    SnapshotPrepare { label: String },

    #[error("Failed to export {label} to {path:?}")]
    Export { label: String, path: PathBuf },

    #[error("Failed to cleanup snapshot: {label}")]
    Cleanup { label: String },

    #[error("Failed to rotate backups in {path:?}: {reason}")]
    Rotation { path: PathBuf, reason: String },

    #[error("Pairs of backup and meta-backups are not even ({count} files). Please remove orphaned files from {path:?}")]
    OrphanedArtifacts { path: PathBuf, count: usize },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a batch does with an item that failed with a given error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Stop processing the remaining items of the batch
    AbortBatch,
    /// Count an error and continue with the next item
    SkipItem,
    /// Count a warning; the backup itself is durable
    Warn,
}

impl Error {
    /// Determine how the orchestrator reacts to this error
    pub fn disposition(&self) -> Disposition {
        match self {
            // A full filesystem fails every subsequent item too
            Error::SpaceThresholdExceeded { .. } => Disposition::AbortBatch,

            // Housekeeping after a completed export
            Error::Cleanup { .. }
            | Error::Rotation { .. }
            | Error::OrphanedArtifacts { .. } => Disposition::Warn,

            Error::InvalidRetention { .. } | Error::InvalidPattern { .. } => Disposition::Warn,

            // Everything else fails only the current item
            _ => Disposition::SkipItem,
        }
    }

    /// Check if this error ends the current batch
    pub fn aborts_batch(&self) -> bool {
        matches!(self.disposition(), Disposition::AbortBatch)
    }
}

/// Result type alias for VmBackup
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_dispositions() {
        let err = Error::SpaceThresholdExceeded {
            remaining: 5,
            threshold: 20,
        };
        assert_eq!(err.disposition(), Disposition::AbortBatch);
        assert!(err.aborts_batch());

        let err = Error::SnapshotCreate {
            label: "VMBACKUP_web1".into(),
        };
        assert_eq!(err.disposition(), Disposition::SkipItem);

        let err = Error::OrphanedArtifacts {
            path: PathBuf::from("/backups/web1"),
            count: 3,
        };
        assert_eq!(err.disposition(), Disposition::Warn);
    }

    #[test]
    fn test_item_errors_skip() {
        let inventory = Error::InventoryUnavailable("no VMs in pool".into());
        assert!(!inventory.aborts_batch());

        let item = Error::AmbiguousVm {
            name: "web1".into(),
        };
        assert_eq!(item.disposition(), Disposition::SkipItem);
    }
}

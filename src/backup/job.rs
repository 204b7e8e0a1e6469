//! Backup work items

use crate::domain::ports::BackupMode;
use crate::selection::{SelectionMatch, SelectionResult};
use serde::{Deserialize, Serialize};

/// Disk exported when a disk-export entry names none
pub const DEFAULT_DISK: &str = "xvda";

/// One VM to back up in one mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJob {
    pub vm_name: String,
    pub mode: BackupMode,
    /// Artifact pairs to keep
    pub max_backups: u32,
    /// Devices to export (disk-export only)
    pub disks: Vec<String>,
}

impl BackupJob {
    /// Resolve a selection match against the default retention
    pub fn from_match(m: &SelectionMatch, mode: BackupMode, default_max_backups: u32) -> Self {
        // -1 and absent both mean the configured default
        let max_backups = match m.max_backups {
            Some(n) if n > 0 => n as u32,
            _ => default_max_backups,
        };

        let disks = match mode {
            BackupMode::DiskExport => m
                .disks
                .clone()
                .unwrap_or_else(|| vec![DEFAULT_DISK.to_string()]),
            BackupMode::FullExport => Vec::new(),
        };

        Self {
            vm_name: m.vm_name.clone(),
            mode,
            max_backups,
            disks,
        }
    }

    /// Jobs for every match of a selection pass, in result order
    pub fn from_selection(
        result: &SelectionResult,
        mode: BackupMode,
        default_max_backups: u32,
    ) -> Vec<Self> {
        result
            .iter()
            .map(|m| Self::from_match(m, mode, default_max_backups))
            .collect()
    }
}

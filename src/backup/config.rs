//! Backup Configuration
//!
//! Settings are layered: built-in defaults, then YAML files in the
//! well-known locations, then an explicit `--config` file, then command
//! line flags. Every layer is a [`ConfigLayer`] of optional values; the
//! merged result is resolved into a [`BackupConfig`].

use crate::domain::ports::VdiExportFormat;
use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// =============================================================================
// Constants
// =============================================================================

const DEFAULT_BASE_DIR: &str = "/mnt/VmBackup";
const DEFAULT_SPACE_THRESHOLD: i64 = 20;
const DEFAULT_MAX_BACKUPS: i64 = 4;
const WRITE_PROBE_FILE: &str = "write.test";

/// Config files read when present, lowest precedence first
const DEFAULT_CONFIG_PATHS: &[&str] = &["/mnt/VmBackup/etc/vmbackup.yaml", "/etc/vmbackup.yaml"];

// =============================================================================
// Config Layer
// =============================================================================

/// One source of settings; unset fields fall through to lower layers
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    pub base_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub space_threshold: Option<i64>,
    pub max_backups: Option<i64>,
    pub compress: Option<bool>,
    pub vdi_export_format: Option<VdiExportFormat>,
    pub pool_backup: Option<bool>,
    pub host_backup: Option<bool>,
    #[serde(default, deserialize_with = "list_or_csv")]
    pub excludes: Option<Vec<String>>,
    #[serde(default, deserialize_with = "list_or_csv")]
    pub vdi_exports: Option<Vec<String>>,
    #[serde(default, deserialize_with = "list_or_csv")]
    pub vm_exports: Option<Vec<String>>,
}

impl ConfigLayer {
    /// Parse a layer from YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        // An empty file is an empty layer
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read a layer from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("(i) Reading configuration file {:?}", path);
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Unable to read config file {:?}: {}", path, e))
        })?;
        Self::from_yaml(&text)
    }

    /// Merge the well-known config files that exist, in precedence order
    pub fn from_default_files() -> Result<Self> {
        let mut layer = Self::default();
        let mut paths: Vec<PathBuf> = DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from).collect();
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(PathBuf::from(home).join("vmbackup.yaml"));
        }

        for path in paths.iter().filter(|p| p.exists()) {
            layer.merge(Self::from_file(path)?);
        }
        Ok(layer)
    }

    /// Overlay `other` on top of this layer
    pub fn merge(&mut self, other: ConfigLayer) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        overlay!(
            base_dir,
            backup_dir,
            space_threshold,
            max_backups,
            compress,
            vdi_export_format,
            pool_backup,
            host_backup,
            excludes,
            vdi_exports,
            vm_exports
        );
    }
}

/// Accept either a YAML sequence or a comma separated string
fn list_or_csv<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrCsv {
        List(Vec<String>),
        Csv(String),
    }

    Ok(match Option::<ListOrCsv>::deserialize(deserializer)? {
        None => None,
        Some(ListOrCsv::List(items)) => Some(items),
        Some(ListOrCsv::Csv(text)) => Some(
            text.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        ),
    })
}

// =============================================================================
// Backup Configuration
// =============================================================================

/// Resolved settings consumed by the backup workflow
#[derive(Debug, Clone, Serialize)]
pub struct BackupConfig {
    /// Base directory of the installation
    pub base_dir: PathBuf,
    /// Root of all backup artifacts
    pub backup_dir: PathBuf,
    /// Minimum free space (percent) required before each item
    pub space_threshold: u8,
    /// Default number of artifact pairs kept per VM or disk
    pub max_backups: u32,
    /// Compress full-VM exports
    pub compress: bool,
    pub vdi_export_format: VdiExportFormat,
    pub pool_backup: bool,
    pub host_backup: bool,
    pub excludes: Vec<String>,
    pub vdi_exports: Vec<String>,
    pub vm_exports: Vec<String>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        let base_dir = PathBuf::from(DEFAULT_BASE_DIR);
        Self {
            backup_dir: base_dir.join("exports"),
            base_dir,
            space_threshold: DEFAULT_SPACE_THRESHOLD as u8,
            max_backups: DEFAULT_MAX_BACKUPS as u32,
            compress: false,
            vdi_export_format: VdiExportFormat::Raw,
            pool_backup: false,
            host_backup: false,
            excludes: Vec::new(),
            vdi_exports: Vec::new(),
            vm_exports: Vec::new(),
        }
    }
}

impl BackupConfig {
    /// Resolve a merged layer against the defaults and check ranges
    pub fn from_layer(layer: ConfigLayer) -> Result<Self> {
        let base_dir = layer.base_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR));
        let backup_dir = layer.backup_dir.unwrap_or_else(|| base_dir.join("exports"));

        let space_threshold = layer.space_threshold.unwrap_or(DEFAULT_SPACE_THRESHOLD);
        if !(1..=100).contains(&space_threshold) {
            return Err(Error::Configuration(format!(
                "space_threshold out of range -> {}",
                space_threshold
            )));
        }

        let max_backups = layer.max_backups.unwrap_or(DEFAULT_MAX_BACKUPS);
        if max_backups < 1 || max_backups > u32::MAX as i64 {
            return Err(Error::Configuration(format!(
                "max_backups out of range -> {}",
                max_backups
            )));
        }

        Ok(Self {
            base_dir,
            backup_dir,
            space_threshold: space_threshold as u8,
            max_backups: max_backups as u32,
            compress: layer.compress.unwrap_or(false),
            vdi_export_format: layer.vdi_export_format.unwrap_or_default(),
            pool_backup: layer.pool_backup.unwrap_or(false),
            host_backup: layer.host_backup.unwrap_or(false),
            excludes: layer.excludes.unwrap_or_default(),
            vdi_exports: layer.vdi_exports.unwrap_or_default(),
            vm_exports: layer.vm_exports.unwrap_or_default(),
        })
    }

    /// Check the backup directory and fill in the default export list
    pub fn validate(&mut self) -> Result<()> {
        debug!("(i) Checking if backup_dir exists");
        if !self.backup_dir.is_dir() {
            return Err(Error::Configuration(format!(
                "backup_dir does not exist -> {:?}",
                self.backup_dir
            )));
        }

        debug!("(i) Checking if backup_dir writeable");
        if !is_writable(&self.backup_dir) {
            return Err(Error::Configuration(format!(
                "backup_dir not writeable -> {:?}",
                self.backup_dir
            )));
        }

        if self.vm_exports.is_empty() && self.vdi_exports.is_empty() {
            debug!("(i) Setting vm_exports to default .* (all VMs)");
            self.vm_exports = vec![".*".to_string()];
        }

        Ok(())
    }

    /// Log the effective settings
    pub fn log_summary(&self) {
        info!("VmBackup running with these settings:");
        info!("  backup_dir        = {}", self.backup_dir.display());
        info!("  space_threshold   = {}", self.space_threshold);
        info!("  compress          = {}", self.compress);
        info!("  max_backups       = {}", self.max_backups);
        info!("  vdi_export_format = {}", self.vdi_export_format);
        info!("  pool_backup       = {}", self.pool_backup);
        info!("  host_backup       = {}", self.host_backup);
    }
}

fn is_writable(dir: &Path) -> bool {
    let probe = dir.join(WRITE_PROBE_FILE);
    match fs::write(&probe, b"ok") {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(e) => {
            debug!("(!) Unable to write to directory {:?}: {}", dir, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = BackupConfig::from_layer(ConfigLayer::default()).unwrap();
        assert_eq!(config.backup_dir, PathBuf::from("/mnt/VmBackup/exports"));
        assert_eq!(config.space_threshold, 20);
        assert_eq!(config.max_backups, 4);
        assert_eq!(config.vdi_export_format, VdiExportFormat::Raw);
        assert!(!config.compress);
    }

    #[test]
    fn test_backup_dir_follows_base_dir() {
        let layer = ConfigLayer {
            base_dir: Some(PathBuf::from("/srv/backup")),
            ..Default::default()
        };
        let config = BackupConfig::from_layer(layer).unwrap();
        assert_eq!(config.backup_dir, PathBuf::from("/srv/backup/exports"));
    }

    #[test]
    fn test_yaml_layer_with_csv_lists() {
        let layer = ConfigLayer::from_yaml(
            r#"
max_backups: 7
vdi_export_format: vhd
excludes: "test.*, scratch"
vm_exports:
  - web.*
  - db1:2
"#,
        )
        .unwrap();

        assert_eq!(layer.max_backups, Some(7));
        assert_eq!(layer.vdi_export_format, Some(VdiExportFormat::Vhd));
        assert_eq!(
            layer.excludes,
            Some(vec!["test.*".to_string(), "scratch".to_string()])
        );
        assert_eq!(
            layer.vm_exports,
            Some(vec!["web.*".to_string(), "db1:2".to_string()])
        );
    }

    #[test]
    fn test_yaml_rejects_unknown_format() {
        assert!(ConfigLayer::from_yaml("vdi_export_format: qcow2").is_err());
        assert!(ConfigLayer::from_yaml("no_such_option: 1").is_err());
        assert!(ConfigLayer::from_yaml("").is_ok());
    }

    #[test]
    fn test_merge_precedence() {
        let mut base = ConfigLayer {
            max_backups: Some(4),
            compress: Some(false),
            ..Default::default()
        };
        base.merge(ConfigLayer {
            compress: Some(true),
            ..Default::default()
        });
        assert_eq!(base.max_backups, Some(4));
        assert_eq!(base.compress, Some(true));
    }

    #[test]
    fn test_range_checks() {
        let layer = ConfigLayer {
            space_threshold: Some(0),
            ..Default::default()
        };
        assert_matches!(BackupConfig::from_layer(layer), Err(Error::Configuration(_)));

        let layer = ConfigLayer {
            max_backups: Some(0),
            ..Default::default()
        };
        assert_matches!(BackupConfig::from_layer(layer), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_validate_directory_and_default_exports() {
        let tmp = TempDir::new().unwrap();
        let mut config = BackupConfig {
            backup_dir: tmp.path().to_path_buf(),
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.vm_exports, vec![".*".to_string()]);
        assert!(!tmp.path().join(WRITE_PROBE_FILE).exists());

        let mut config = BackupConfig {
            backup_dir: tmp.path().to_path_buf(),
            vdi_exports: vec!["db1".into()],
            ..Default::default()
        };
        config.validate().unwrap();
        assert!(config.vm_exports.is_empty());
    }

    #[test]
    fn test_validate_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let mut config = BackupConfig {
            backup_dir: tmp.path().join("missing"),
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Configuration(_)));
    }
}

//! VmBackup
//!
//! Backs up the VMs of the local XenServer pool, optionally together with
//! the dom0 of every host and the pool database.
//!
//! Settings come from YAML files, an explicit `--config` file and the flags
//! below, in increasing order of precedence.

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vmbackup::backup::artifacts::{date_string, format_elapsed};
use vmbackup::{
    BackendFactory, BackupConfig, BackupOrchestrator, ConfigLayer, FsSpaceProbe, HypervisorBackend,
    Selections, VdiExportFormat, XeConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// VmBackup - VM, host and pool database backups for XenServer pools
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Additional YAML config file
    #[arg(long, short, env = "VMBACKUP_CONFIG")]
    config: Option<PathBuf>,

    /// Base directory of the installation
    #[arg(long, env = "VMBACKUP_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Directory receiving the backups
    #[arg(long, env = "VMBACKUP_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,

    /// Minimum free space (percent) required before each backup
    #[arg(long)]
    space_threshold: Option<i64>,

    /// Default number of backups kept per VM or disk
    #[arg(long)]
    max_backups: Option<i64>,

    /// Compress full-VM exports
    #[arg(long)]
    compress: bool,

    /// Disk export format (raw, vhd)
    #[arg(long)]
    vdi_export_format: Option<VdiExportFormat>,

    /// Back up the pool database
    #[arg(long)]
    pool_backup: bool,

    /// Back up the dom0 of every host
    #[arg(long)]
    host_backup: bool,

    /// Full-VM export entry (name or regex, optionally `:max_backups`)
    #[arg(long = "vm-export", short = 'e')]
    vm_exports: Vec<String>,

    /// Disk export entry (`name[:max_backups[:disk1;disk2]]`)
    #[arg(long = "vdi-export", short = 'E')]
    vdi_exports: Vec<String>,

    /// VM name or regex never to back up
    #[arg(long = "exclude", short = 'x')]
    excludes: Vec<String>,

    /// Show the resolved settings and selections without backing up
    #[arg(long)]
    preview: bool,

    /// Hypervisor backend (xe, mock)
    #[arg(long, env = "VMBACKUP_BACKEND", default_value = "xe")]
    backend: String,

    /// Path of the xe binary
    #[arg(long, env = "XE_PATH", default_value = "/opt/xensource/bin/xe")]
    xe_path: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Settings given on the command line
    fn layer(&self) -> ConfigLayer {
        let list = |items: &Vec<String>| (!items.is_empty()).then(|| items.clone());
        ConfigLayer {
            base_dir: self.base_dir.clone(),
            backup_dir: self.backup_dir.clone(),
            space_threshold: self.space_threshold,
            max_backups: self.max_backups,
            compress: self.compress.then_some(true),
            vdi_export_format: self.vdi_export_format,
            pool_backup: self.pool_backup.then_some(true),
            host_backup: self.host_backup.then_some(true),
            excludes: list(&self.excludes),
            vdi_exports: list(&self.vdi_exports),
            vm_exports: list(&self.vm_exports),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = load_config(&args)?;

    let begin = Local::now();
    info!("************************");
    info!("VmBackup running on {} ...", get_hostname());
    info!("  Version: {}", vmbackup::VERSION);
    info!("  Start time: {}", date_string(&begin));
    config.log_summary();

    let hypervisor = BackendFactory::create(
        &args.backend,
        XeConfig {
            xe_path: args.xe_path.clone(),
            ..Default::default()
        },
    )?;
    info!("  Backend: {}", hypervisor.backend_name());

    let orchestrator = BackupOrchestrator::new(config, hypervisor, Arc::new(FsSpaceProbe));

    let inventory = orchestrator
        .gather_inventory()
        .await
        .context("gathering pool information")?;
    let selections = orchestrator.select(inventory);
    log_selections(&selections);

    if args.preview {
        info!("Preview only, no backups performed");
        return Ok(());
    }

    let report = orchestrator.run_all(&selections).await;

    let end = Local::now();
    info!("************************");
    info!(
        "VmBackup finished at {} - time:{}",
        date_string(&end),
        format_elapsed(&begin, &end)
    );
    if report.error_count() > 0 || report.warning_count() > 0 {
        warn!(
            "(!) Run completed with {} errors and {} warnings",
            report.error_count(),
            report.warning_count()
        );
    }
    Ok(())
}

/// Merge every config layer and validate the result
fn load_config(args: &Args) -> anyhow::Result<BackupConfig> {
    let mut layer = ConfigLayer::from_default_files().context("reading default config files")?;
    if let Some(path) = &args.config {
        layer.merge(
            ConfigLayer::from_file(path).with_context(|| format!("reading {}", path.display()))?,
        );
    }
    layer.merge(args.layer());

    let mut config = BackupConfig::from_layer(layer)?;
    config.validate()?;
    Ok(config)
}

fn log_selections(selections: &Selections) {
    info!("************************");
    info!("  excludes    = {}", selections.excludes.display_list());
    info!("  vdi_exports = {}", selections.disk_exports.display_list());
    info!("  vm_exports  = {}", selections.full_exports.display_list());
    if !selections.unselected.is_empty() {
        info!(
            "  not selected: {}",
            selections.unselected.names().join(", ")
        );
    }
}

fn get_hostname() -> String {
    // Try /etc/hostname first
    if let Ok(hostname) = fs::read_to_string("/etc/hostname") {
        return hostname.trim().to_string();
    }

    // Fall back to hostname command
    #[cfg(unix)]
    {
        use std::process::Command;
        if let Ok(output) = Command::new("hostname").output() {
            if output.status.success() {
                return String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
        }
    }

    "unknown".to_string()
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }
}

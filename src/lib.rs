//! VmBackup - Selection-driven backups for XenServer pools
//!
//! Backs up the VMs of a XenServer/XCP-ng pool to a mounted directory,
//! either as whole-VM archives or as per-disk images, and keeps a bounded
//! number of backups per VM.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         Run Driver (CLI)                      │
//! ├───────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌──────────────────┐  ┌──────────────┐  │
//! │  │   Inventory &   │  │      Backup      │  │  Retention   │  │
//! │  │    Selector     │─▶│   Orchestrator   │─▶│   Rotator    │  │
//! │  └─────────────────┘  └────────┬─────────┘  └──────────────┘  │
//! ├────────────────────────────────┼──────────────────────────────┤
//! │                     Hypervisor Port                            │
//! │  ┌─────────────────────────────┐  ┌────────────────────────┐  │
//! │  │      xe CLI (local pool)    │  │    In-memory mock      │  │
//! │  └─────────────────────────────┘  └────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`selection`]: VM selection patterns and inventory matching
//! - [`backup`]: Configuration, artifacts, rotation and the orchestrator
//! - [`hypervisor`]: Hypervisor backend adapters
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod backup;
pub mod domain;
pub mod error;
pub mod hypervisor;
pub mod selection;

// Re-export commonly used types
pub use backup::{
    BackupConfig, BackupJob, BackupOrchestrator, BatchSummary, ConfigLayer, FsSpaceProbe,
    Outcome, RunReport,
};

pub use domain::ports::{
    BackupMode, HypervisorBackend, HypervisorRef, SnapshotKind, SpaceProbe, SpaceProbeRef,
    VdiExportFormat,
};

pub use error::{Disposition, Error, Result};

pub use hypervisor::{BackendFactory, MockBackend, XeCliBackend, XeConfig};

pub use selection::{validate, Inventory, SelectionMatch, SelectionResult, Selections, VmSpec};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

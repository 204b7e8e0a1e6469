//! Backup Workflow
//!
//! Configuration, artifact layout, retention and the orchestrator that
//! runs backup batches against a hypervisor backend.

pub mod artifacts;
pub mod config;
pub mod job;
pub mod metadata;
pub mod orchestrator;
pub mod rotation;
pub mod space;
pub mod summary;

pub use artifacts::{ArtifactFamily, ArtifactSet};
pub use config::{BackupConfig, ConfigLayer};
pub use job::BackupJob;
pub use orchestrator::{BackupOrchestrator, RunReport};
pub use rotation::{rotate, rotate_family};
pub use space::{FsSpaceProbe, ScriptedSpaceProbe};
pub use summary::{BatchSummary, Outcome};

//! Domain layer - Port definitions shared by selection and backup
//!
//! Defines the hypervisor and filesystem ports the backup workflow is
//! written against, and the typed records those ports return.

pub mod ports;

pub use ports::*;

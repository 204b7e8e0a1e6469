//! Hypervisor Backend Adapters
//!
//! Provides adapters for the hypervisor port:
//! - xe: the local XenServer pool through the `xe` CLI
//! - mock: an in-memory pool for tests and dry runs

pub mod mock;
pub mod xe;

pub use mock::{MockBackend, MockOp};
pub use xe::{XeCliBackend, XeConfig};

use crate::domain::ports::HypervisorRef;
use crate::error::{Error, Result};
use std::sync::Arc;

/// Factory for creating hypervisor backends
pub struct BackendFactory;

impl BackendFactory {
    /// Create a backend by name
    pub fn create(name: &str, config: XeConfig) -> Result<HypervisorRef> {
        match name.to_lowercase().as_str() {
            "xe" | "local" => Ok(Arc::new(XeCliBackend::new(config))),
            "mock" => Ok(Arc::new(MockBackend::sample_pool())),
            _ => Err(Error::Configuration(format!(
                "unknown hypervisor backend -> {}",
                name
            ))),
        }
    }
}

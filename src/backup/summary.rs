//! Batch outcome accounting

use crate::error::{Disposition, Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Overall classification of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    SuccessWithErrors,
    SuccessWithWarning,
    Error,
    Warning,
    /// No item was counted at all
    Unknown,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Outcome::Success => "Success",
            Outcome::SuccessWithErrors => "Success with Errors",
            Outcome::SuccessWithWarning => "Success with Warning",
            Outcome::Error => "Error",
            Outcome::Warning => "Warning",
            Outcome::Unknown => "Unknown",
        };
        write!(f, ">> {} <<", text)
    }
}

/// Success, warning and error counters of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub success: u32,
    pub warning: u32,
    pub error: u32,
}

impl BatchSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self) {
        self.success += 1;
    }

    pub fn record_warning(&mut self) {
        self.warning += 1;
    }

    pub fn record_error(&mut self) {
        self.error += 1;
    }

    /// Count a failure according to its disposition
    pub fn record(&mut self, err: &Error) {
        match err.disposition() {
            Disposition::Warn => self.record_warning(),
            Disposition::SkipItem | Disposition::AbortBatch => self.record_error(),
        }
    }

    /// Classify the batch; errors outrank warnings
    pub fn outcome(&self) -> Outcome {
        match (self.success > 0, self.warning > 0, self.error > 0) {
            (true, _, true) => Outcome::SuccessWithErrors,
            (true, true, false) => Outcome::SuccessWithWarning,
            (true, false, false) => Outcome::Success,
            (false, _, true) => Outcome::Error,
            (false, true, false) => Outcome::Warning,
            (false, false, false) => Outcome::Unknown,
        }
    }

    /// Log the counters and the outcome marker
    pub fn log(&self) {
        info!(
            "Summary - S:{} W:{} E:{}",
            self.success, self.warning, self.error
        );
        info!("{}", self.outcome());
    }
}

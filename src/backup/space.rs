//! Backup Space Probes
//!
//! Free-space checks for the filesystem holding the backup directory.

use crate::domain::ports::SpaceProbe;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use tracing::debug;

// =============================================================================
// Filesystem Probe
// =============================================================================

/// Queries the mounted filesystem the way `df --output=pcent` reports it
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn remaining_percent(&self, path: &Path) -> Result<u8> {
        let total = fs2::total_space(path)?;
        let free = fs2::free_space(path)?;
        let available = fs2::available_space(path)?;

        let used = total.saturating_sub(free);
        let remaining = remaining_percent(used, available);
        debug!("(i) Backup space remaining {:?}: {}%", path, remaining);
        Ok(remaining)
    }
}

/// Percent remaining from used and available bytes.
///
/// Used percent is rounded up, as `df` does, so a nearly full filesystem
/// never reports spare capacity it does not have.
fn remaining_percent(used: u64, available: u64) -> u8 {
    let usable = used as u128 + available as u128;
    if usable == 0 {
        return 0;
    }
    let used_percent = (used as u128 * 100).div_ceil(usable);
    100u8.saturating_sub(used_percent.min(100) as u8)
}

// =============================================================================
// Scripted Probe
// =============================================================================

/// Returns a scripted series of readings; the last one repeats
#[derive(Debug)]
pub struct ScriptedSpaceProbe {
    readings: Mutex<VecDeque<u8>>,
    last: Mutex<u8>,
}

impl ScriptedSpaceProbe {
    /// Always report the same value
    pub fn fixed(percent: u8) -> Self {
        Self::sequence([percent])
    }

    /// Report values in order, then keep repeating the final one
    pub fn sequence(readings: impl IntoIterator<Item = u8>) -> Self {
        let readings: VecDeque<u8> = readings.into_iter().collect();
        let last = readings.back().copied().unwrap_or(0);
        Self {
            readings: Mutex::new(readings),
            last: Mutex::new(last),
        }
    }
}

impl SpaceProbe for ScriptedSpaceProbe {
    fn remaining_percent(&self, _path: &Path) -> Result<u8> {
        let next = self.readings.lock().pop_front();
        let mut last = self.last.lock();
        if let Some(value) = next {
            *last = value;
        }
        Ok(*last)
    }
}

//! VM Selector
//!
//! Resolves selection entries against the live VM inventory. The inventory
//! is consumed destructively: a VM matched by one pass is removed and can
//! no longer be selected by a later pass of the same run.

use crate::selection::spec::VmSpec;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

// =============================================================================
// Inventory
// =============================================================================

/// Known VM names of the pool, in pool enumeration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    names: Vec<String>,
}

impl Inventory {
    /// Build an inventory, dropping blank and duplicate names
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inventory = Self::default();
        for name in names {
            let name: String = name.into();
            if !name.trim().is_empty() && !inventory.contains(&name) {
                inventory.names.push(name);
            }
        }
        inventory
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Remove a name, returning whether it was present
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.names.len();
        self.names.retain(|n| n != name);
        self.names.len() != before
    }
}

impl<S: Into<String>> FromIterator<S> for Inventory {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

// =============================================================================
// Selection Result
// =============================================================================

/// A VM resolved by a selection entry, carrying the entry's overrides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionMatch {
    pub vm_name: String,
    pub max_backups: Option<i32>,
    pub disks: Option<Vec<String>>,
}

impl SelectionMatch {
    fn from_spec(vm_name: &str, spec: &VmSpec) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            max_backups: spec.max_backups,
            // A disk list is only meaningful next to a retention field
            disks: spec.max_backups.and(spec.disks.clone()),
        }
    }
}

/// Renders as `name`, `name:max_backups` or `name:max_backups:disk1;disk2`
impl fmt::Display for SelectionMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.vm_name)?;
        if let Some(max) = self.max_backups {
            write!(f, ":{}", max)?;
            if let Some(disks) = &self.disks {
                write!(f, ":{}", disks.join(";"))?;
            }
        }
        Ok(())
    }
}

/// Ordered matches produced by one selection pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionResult {
    matches: Vec<SelectionMatch>,
}

impl SelectionResult {
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SelectionMatch> {
        self.matches.iter()
    }

    /// VM names in result order
    pub fn vm_names(&self) -> Vec<&str> {
        self.matches.iter().map(|m| m.vm_name.as_str()).collect()
    }

    /// Sort by rendered form, ignoring case
    pub fn sort_case_insensitive(&mut self) {
        self.matches
            .sort_by_cached_key(|m| m.to_string().to_lowercase());
    }

    /// Comma separated rendering for run logs
    pub fn display_list(&self) -> String {
        self.matches
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl IntoIterator for SelectionResult {
    type Item = SelectionMatch;
    type IntoIter = std::vec::IntoIter<SelectionMatch>;

    fn into_iter(self) -> Self::IntoIter {
        self.matches.into_iter()
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Resolve one list of selection entries against the inventory.
///
/// Takes the inventory by value and hands it back with every matched VM
/// removed, so the next pass only sees what is left.
pub fn validate<S: AsRef<str>>(
    label: &str,
    entries: &[S],
    mut inventory: Inventory,
) -> (SelectionResult, Inventory) {
    info!("**** {} ****", label.to_uppercase());
    debug!(
        "(i) VM List: {:?}",
        entries.iter().map(AsRef::as_ref).collect::<Vec<_>>()
    );

    let mut result = SelectionResult::default();

    // Nothing to match against, or nothing to match with: an absent list
    // must never turn into a match-everything pattern
    if inventory.is_empty() || entries.is_empty() {
        info!(">> Success <<");
        return (result, inventory);
    }

    let mut found_match = false;

    for entry in entries {
        let entry = entry.as_ref();
        debug!("(i) Checking for matches: {}", entry);

        let spec = VmSpec::parse_lenient(entry);
        let matcher = match spec.matcher() {
            Ok(m) => m,
            Err(_) => {
                warn!("(!) Invalid regex: {}", spec.pattern);
                continue;
            }
        };

        let matched: Vec<String> = inventory
            .names()
            .iter()
            .filter(|name| matcher.matches(name))
            .cloned()
            .collect();

        if matched.is_empty() {
            warn!("(!) No matching VMs found: {}", spec.pattern);
            continue;
        }

        for name in matched {
            debug!("(i) Match found: {}", name);
            result.matches.push(SelectionMatch::from_spec(&name, &spec));
            inventory.remove(&name);
        }
        found_match = true;
    }

    if found_match {
        info!(">> Success <<");
    } else {
        info!(">> Error <<");
    }

    (result, inventory)
}

// =============================================================================
// Selections
// =============================================================================

/// The three sorted work lists of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selections {
    pub excludes: SelectionResult,
    pub disk_exports: SelectionResult,
    pub full_exports: SelectionResult,
    /// VMs selected by none of the lists
    pub unselected: Inventory,
}

impl Selections {
    /// Run excludes, disk-export and full-export passes in that order
    pub fn resolve<S: AsRef<str>>(
        inventory: Inventory,
        excludes: &[S],
        vdi_exports: &[S],
        vm_exports: &[S],
    ) -> Self {
        let (mut excludes, inventory) = validate("excludes", excludes, inventory);
        let (mut disk_exports, inventory) = validate("vdi-exports", vdi_exports, inventory);
        let (mut full_exports, unselected) = validate("vm-exports", vm_exports, inventory);

        excludes.sort_case_insensitive();
        disk_exports.sort_case_insensitive();
        full_exports.sort_case_insensitive();

        Self {
            excludes,
            disk_exports,
            full_exports,
            unselected,
        }
    }
}

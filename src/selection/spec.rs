//! Selection entries
//!
//! A selection entry has the form `name[:max_backups[:disk1;disk2;...]]`
//! where `name` is either a literal VM name or a regex.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Characters that make a pattern a literal VM name
static LITERAL_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[\w\s\-_]+$").expect("literal name pattern is valid")
});

// =============================================================================
// Match Mode
// =============================================================================

/// How a pattern is compared against VM names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Exact string equality
    Literal,
    /// Prefix-anchored regex match
    Regex,
}

impl MatchMode {
    /// Derive the match mode of a pattern
    pub fn of(pattern: &str) -> Self {
        if LITERAL_NAME.is_match(pattern) {
            MatchMode::Literal
        } else {
            MatchMode::Regex
        }
    }
}

/// Compiled form of a pattern
#[derive(Debug, Clone)]
pub enum Matcher {
    Literal(String),
    Regex(Regex),
}

impl Matcher {
    /// Compile a pattern according to its match mode
    pub fn compile(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::InvalidPattern {
                pattern: pattern.to_string(),
            });
        }

        match MatchMode::of(pattern) {
            MatchMode::Literal => Ok(Matcher::Literal(pattern.to_string())),
            MatchMode::Regex => {
                // Anchor at the start only: "web" matches "web10"
                let anchored = format!("^(?:{})", pattern);
                Regex::new(&anchored)
                    .map(Matcher::Regex)
                    .map_err(|_| Error::InvalidPattern {
                        pattern: pattern.to_string(),
                    })
            }
        }
    }

    /// Check a candidate VM name against this matcher
    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            Matcher::Literal(name) => name == candidate,
            Matcher::Regex(re) => re.is_match(candidate),
        }
    }

    pub fn mode(&self) -> MatchMode {
        match self {
            Matcher::Literal(_) => MatchMode::Literal,
            Matcher::Regex(_) => MatchMode::Regex,
        }
    }
}

// =============================================================================
// VM Spec
// =============================================================================

/// A parsed selection entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    /// VM name or regex
    pub pattern: String,
    /// Retention override: -1 (use default) or a positive count
    pub max_backups: Option<i32>,
    /// Disk devices to export (disk-export only)
    pub disks: Option<Vec<String>>,
}

impl VmSpec {
    /// Create a spec without overrides
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            max_backups: None,
            disks: None,
        }
    }

    /// Parse an entry, rejecting an invalid retention override
    pub fn parse(entry: &str) -> Result<Self> {
        let fields: Vec<&str> = entry.split(':').collect();
        let pattern = fields[0].to_string();

        let Some(raw_max) = fields.get(1) else {
            return Ok(Self::new(pattern));
        };

        let max_backups = parse_max_backups(raw_max).map_err(|reason| Error::InvalidRetention {
            entry: entry.to_string(),
            reason,
        })?;

        // A disk list is only recognised as the third and last field
        let disks = match fields.len() {
            3 => parse_disks(fields[2]),
            n if n > 3 => {
                warn!("(!) Ignoring disk list of {}: too many fields", entry);
                None
            }
            _ => None,
        };

        Ok(Self {
            pattern,
            max_backups: Some(max_backups),
            disks,
        })
    }

    /// Parse an entry, degrading an invalid retention override to none.
    ///
    /// The name portion stays usable; the disk list of such an entry is
    /// dropped together with the override.
    pub fn parse_lenient(entry: &str) -> Self {
        match Self::parse(entry) {
            Ok(spec) => spec,
            Err(e) => {
                warn!("(!) {}", e);
                let pattern = entry.split(':').next().unwrap_or_default();
                Self::new(pattern)
            }
        }
    }

    /// Derived match mode of the pattern
    pub fn match_mode(&self) -> MatchMode {
        MatchMode::of(&self.pattern)
    }

    /// Compile the pattern
    pub fn matcher(&self) -> Result<Matcher> {
        Matcher::compile(&self.pattern)
    }
}

fn parse_max_backups(raw: &str) -> std::result::Result<i32, String> {
    let value: i32 = raw
        .trim()
        .parse()
        .map_err(|_| format!("max_backups non-integer: {:?}", raw))?;

    if value == -1 || value > 0 {
        Ok(value)
    } else {
        Err(format!("max_backups out of range: {}", value))
    }
}

fn parse_disks(raw: &str) -> Option<Vec<String>> {
    let disks: Vec<String> = raw
        .split(';')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(String::from)
        .collect();

    if disks.is_empty() {
        None
    } else {
        Some(disks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_match_mode() {
        assert_eq!(MatchMode::of("web1"), MatchMode::Literal);
        assert_eq!(MatchMode::of("my vm-01_a"), MatchMode::Literal);
        assert_eq!(MatchMode::of("web.*"), MatchMode::Regex);
        assert_eq!(MatchMode::of("db[0-9]"), MatchMode::Regex);
    }

    #[test]
    fn test_literal_is_exact() {
        let matcher = Matcher::compile("web1").unwrap();
        assert_eq!(matcher.mode(), MatchMode::Literal);
        assert!(matcher.matches("web1"));
        assert!(!matcher.matches("web10"));
        assert!(!matcher.matches("xweb1"));
    }

    #[test]
    fn test_regex_is_prefix_anchored() {
        let matcher = Matcher::compile("test.*").unwrap();
        assert!(matcher.matches("test1"));
        assert!(!matcher.matches("mytest1"));

        let matcher = Matcher::compile("web[12]").unwrap();
        assert!(matcher.matches("web10"));
        assert!(!matcher.matches("web3"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert_matches!(Matcher::compile("web(["), Err(Error::InvalidPattern { .. }));
        assert_matches!(Matcher::compile(""), Err(Error::InvalidPattern { .. }));
    }

    #[test]
    fn test_parse_full_entry() {
        let spec = VmSpec::parse("db1:3:xvda;xvdb").unwrap();
        assert_eq!(spec.pattern, "db1");
        assert_eq!(spec.max_backups, Some(3));
        assert_eq!(spec.disks, Some(vec!["xvda".to_string(), "xvdb".to_string()]));
    }

    #[test]
    fn test_parse_ignores_extra_fields() {
        let spec = VmSpec::parse("db1:3:xvda:junk").unwrap();
        assert_eq!(spec.pattern, "db1");
        assert_eq!(spec.max_backups, Some(3));
        assert_eq!(spec.disks, None);
    }

    #[test]
    fn test_parse_name_only() {
        let spec = VmSpec::parse("web.*").unwrap();
        assert_eq!(spec, VmSpec::new("web.*"));
        assert_eq!(spec.match_mode(), MatchMode::Regex);
    }

    #[test]
    fn test_parse_default_retention_marker() {
        let spec = VmSpec::parse("web1:-1").unwrap();
        assert_eq!(spec.max_backups, Some(-1));
        assert_eq!(spec.disks, None);
    }

    #[test]
    fn test_parse_rejects_bad_retention() {
        for entry in ["web1:0", "web1:-2", "web1:abc", "web1:", "web1:0:xvda"] {
            assert_matches!(
                VmSpec::parse(entry),
                Err(Error::InvalidRetention { .. }),
                "entry {} should be rejected",
                entry
            );
        }
    }

    #[test]
    fn test_parse_lenient_keeps_name() {
        let spec = VmSpec::parse_lenient("web1:0:xvda");
        assert_eq!(spec, VmSpec::new("web1"));

        let spec = VmSpec::parse_lenient("web.*:many");
        assert_eq!(spec.pattern, "web.*");
        assert_eq!(spec.max_backups, None);
    }

    #[test]
    fn test_parse_empty_disk_list() {
        let spec = VmSpec::parse("db1:2:").unwrap();
        assert_eq!(spec.max_backups, Some(2));
        assert_eq!(spec.disks, None);

        let spec = VmSpec::parse("db1:2: xvda ; ;xvdc").unwrap();
        assert_eq!(spec.disks, Some(vec!["xvda".to_string(), "xvdc".to_string()]));
    }
}

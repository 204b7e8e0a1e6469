//! Selection Module
//!
//! Parses user selection entries and resolves them against the pool's VM
//! inventory into disjoint exclude, disk-export and full-export lists.

pub mod spec;
pub mod selector;

pub use spec::*;
pub use selector::*;

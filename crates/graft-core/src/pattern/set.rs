//! Named pattern collections.
//!
//! Scan targets drift between builds of a host image, so deployments keep
//! their patterns in a versioned JSON file instead of hard-coding them.
//! Each entry carries the pattern text plus the byte offset from the match
//! to the address the caller actually wants.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pattern::Pattern;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternEntry {
    pub name: String,
    pub pattern: String,
    /// Offset added to the match address to reach the actual target.
    #[serde(default)]
    pub offset: i64,
}

impl PatternEntry {
    pub fn compile(&self) -> Result<Pattern> {
        Pattern::parse(&self.pattern)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSet {
    pub version: String,
    pub entries: Vec<PatternEntry>,
}

impl PatternSet {
    pub fn entry(&self, name: &str) -> Option<&PatternEntry> {
        self.entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
    }
}

pub fn load_pattern_set<P: AsRef<Path>>(path: P) -> Result<PatternSet> {
    let content = fs::read_to_string(&path)?;
    let set = serde_json::from_str(&content)?;
    Ok(set)
}

pub fn save_pattern_set<P: AsRef<Path>>(path: P, set: &PatternSet) -> Result<()> {
    let content = serde_json::to_string_pretty(set)?;
    fs::write(path, content)?;
    Ok(())
}

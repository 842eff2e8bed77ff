//! Image list files: one image per line, `#` starts a comment.
//!
//! ```text
//! # rancher images
//! docker.io/rancher/rancher:v2.8.0
//! docker.io/rancher/shell:v0.1.22  harbor.local/mirror/shell:v0.1.22
//! ```
//!
//! The optional second field is an explicit mirror destination.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use tracing::warn;

use super::scheduler::Job;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub source: String,
    pub destination: Option<String>,
}

impl ListEntry {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            destination: None,
        }
    }
}

impl fmt::Display for ListEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.destination {
            Some(destination) => write!(f, "{} {}", self.source, destination),
            None => write!(f, "{}", self.source),
        }
    }
}

/// Named by the line it came from, so a failed list can be fed back in
impl Job for ListEntry {
    fn name(&self) -> String {
        self.to_string()
    }
}

pub fn parse_list(content: &str) -> Result<Vec<ListEntry>> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let entry = match fields.as_slice() {
            [source] => ListEntry::new(source),
            [source, destination] => ListEntry {
                source: source.to_string(),
                destination: Some(destination.to_string()),
            },
            _ => bail!("line {}: expected at most two fields, got {:?}", number + 1, line),
        };
        if !seen.insert(entry.to_string()) {
            warn!("Ignoring duplicate image {}", entry);
            continue;
        }
        entries.push(entry);
    }
    Ok(entries)
}

pub fn read_list(path: &Path) -> Result<Vec<ListEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read image list {}", path.display()))?;
    parse_list(&content).with_context(|| format!("Invalid image list {}", path.display()))
}

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;

/// Deny-list of server name patterns, one regex per line. An empty
/// blacklist allows everything.
#[derive(Debug, Default)]
pub struct Blacklist {
    patterns: Vec<Regex>,
}

impl Blacklist {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read blacklist {}", path.display()))?;
        let mut patterns = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            // Patterns match the whole server name, so "(.*\.)?ads\.example\.com"
            // blocks the domain and its subdomains but not lookalikes.
            let pattern = Regex::new(&format!("^(?:{line})$"))
                .with_context(|| format!("bad blacklist pattern {line:?}"))?;
            patterns.push(pattern);
        }
        Ok(Self { patterns })
    }

    pub fn is_allowed(&self, server: &str) -> bool {
        !self.patterns.iter().any(|p| p.is_match(server))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

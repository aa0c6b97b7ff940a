// src/dpkg.rs

//! Readers for the dpkg status database and apt's extended_states file
//!
//! Both files are sequences of `Key: value` stanzas separated by blank
//! lines; continuation lines start with whitespace.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::debug;

/// A conffile entry recorded in the status database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conffile {
    pub path: String,
    pub md5sum: String,
    pub obsolete: bool,
}

/// One package stanza from the dpkg status database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusEntry {
    pub package: String,
    pub version: String,
    pub architecture: String,
    /// Raw `Status:` field, e.g. `install ok installed`
    pub status: String,
    pub depends: Vec<String>,
    pub conffiles: Vec<Conffile>,
}

impl StatusEntry {
    /// Package is unpacked and configured
    pub fn is_installed(&self) -> bool {
        self.status.split_whitespace().nth(2) == Some("installed")
    }
}

/// Parse a dpkg status file; a missing file reads as empty
pub fn read_status(path: &Path) -> Result<Vec<StatusEntry>> {
    if !path.exists() {
        debug!("No dpkg status at {}", path.display());
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).map_err(|e| Error::io_at(path, e))?;
    Ok(parse_status(&content))
}

/// Parse dpkg status text
pub fn parse_status(content: &str) -> Vec<StatusEntry> {
    stanzas(content)
        .into_iter()
        .filter_map(|fields| {
            let mut entry = StatusEntry::default();
            for (key, value) in fields {
                match key.as_str() {
                    "Package" => entry.package = value.trim().to_string(),
                    "Version" => entry.version = value.trim().to_string(),
                    "Architecture" => entry.architecture = value.trim().to_string(),
                    "Status" => entry.status = value.trim().to_string(),
                    "Depends" | "Pre-Depends" => entry.depends.extend(parse_depends(&value)),
                    "Conffiles" => entry.conffiles = parse_conffiles(&value),
                    _ => {}
                }
            }
            (!entry.package.is_empty()).then_some(entry)
        })
        .collect()
}

/// Package names marked `Auto-Installed: 1` in apt's extended_states
pub fn read_auto_installed(path: &Path) -> Result<BTreeSet<String>> {
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let content = fs::read_to_string(path).map_err(|e| Error::io_at(path, e))?;
    Ok(parse_auto_installed(&content))
}

pub fn parse_auto_installed(content: &str) -> BTreeSet<String> {
    stanzas(content)
        .into_iter()
        .filter_map(|fields| {
            let fields: BTreeMap<String, String> = fields.into_iter().collect();
            let auto = fields.get("Auto-Installed").map(|v| v.trim()) == Some("1");
            match fields.get("Package") {
                Some(name) if auto => Some(name.trim().to_string()),
                _ => None,
            }
        })
        .collect()
}

/// First alternative of every dependency, without version constraints
fn parse_depends(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(|dep| {
            let first = dep.split('|').next()?.trim();
            let name = first
                .split(|c: char| c.is_whitespace() || c == '(')
                .next()?
                .split(':')
                .next()?;
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

fn parse_conffiles(value: &str) -> Vec<Conffile> {
    value
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [path, md5sum] => Some(Conffile {
                    path: path.to_string(),
                    md5sum: md5sum.to_string(),
                    obsolete: false,
                }),
                [path, md5sum, flag, ..] => Some(Conffile {
                    path: path.to_string(),
                    md5sum: md5sum.to_string(),
                    obsolete: *flag == "obsolete",
                }),
                _ => None,
            }
        })
        .collect()
}

/// Split stanza text into ordered `(key, value)` lists
///
/// Continuation lines are appended to the previous value on a new line.
fn stanzas(content: &str) -> Vec<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut current: Vec<(String, String)> = Vec::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            continue;
        }
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = current.last_mut() {
                value.push('\n');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            current.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

// src/selection.rs

//! Package selection codec
//!
//! The `installed.pkgs` member holds one `name version auto` line per
//! installed package, in the order the source system's package database
//! listed them. `foreign.pkgs` has the same shape with an origin label in
//! the last column.

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::fmt::Write as _;

/// One recorded package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    pub name: String,
    pub version: String,
    /// Pulled in as a dependency rather than requested by the user
    pub auto_installed: bool,
}

impl PackageRecord {
    pub fn new(name: impl Into<String>, version: impl Into<String>, auto_installed: bool) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            auto_installed,
        }
    }
}

/// A recorded package whose install origin is not the host vendor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignRecord {
    pub name: String,
    pub version: String,
    pub origin: String,
}

/// Label used when a foreign origin has no name
pub const UNKNOWN_ORIGIN: &str = "unknown";

/// Ordered package records plus the capture-time diagnostics
///
/// The diagnostic sets are informational only and are never written to the
/// archive as authoritative data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageSelection {
    pub records: Vec<PackageRecord>,
    /// Installed packages with no fetchable candidate
    pub not_downloadable: BTreeSet<String>,
    /// Installed version unreachable although a candidate exists
    pub version_mismatch: BTreeSet<String>,
}

impl PackageSelection {
    pub fn new(records: Vec<PackageRecord>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PackageRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn auto_installed_count(&self) -> usize {
        self.records.iter().filter(|r| r.auto_installed).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PackageRecord> {
        self.records.iter()
    }
}

/// Serialize records as `name version 0|1` lines
pub fn encode(records: &[PackageRecord]) -> Vec<u8> {
    let mut out = String::new();
    for record in records {
        let _ = writeln!(
            out,
            "{} {} {}",
            record.name,
            record.version,
            u8::from(record.auto_installed)
        );
    }
    out.into_bytes()
}

/// Parse an `installed.pkgs` member
///
/// Blank lines and `#` comments are skipped. Any other line must have
/// exactly three whitespace-separated fields and a `0`/`1` auto flag.
pub fn decode(member: &str, data: &[u8]) -> Result<PackageSelection> {
    let mut records = Vec::new();
    for (line_no, fields) in records_of(member, data)? {
        let [name, version, auto] = fields;
        let auto_installed = match auto {
            "0" => false,
            "1" => true,
            _ => {
                return Err(Error::MalformedRecord {
                    member: member.to_string(),
                    line: line_no,
                    content: format!("{} {} {}", name, version, auto),
                });
            }
        };
        records.push(PackageRecord::new(name, version, auto_installed));
    }
    Ok(PackageSelection::new(records))
}

/// Serialize foreign records as `name version origin` lines
pub fn encode_foreign(records: &[ForeignRecord]) -> Vec<u8> {
    let mut out = String::new();
    for record in records {
        let origin = if record.origin.trim().is_empty() {
            UNKNOWN_ORIGIN
        } else {
            record.origin.as_str()
        };
        let _ = writeln!(out, "{} {} {}", record.name, record.version, origin);
    }
    out.into_bytes()
}

/// Parse a `foreign.pkgs` member
///
/// The origin label is free text and may contain spaces; it takes the rest
/// of the line after the version.
pub fn decode_foreign(member: &str, data: &[u8]) -> Result<Vec<ForeignRecord>> {
    let mut out = Vec::new();
    for (line_no, line) in content_lines(member, data)? {
        let mut fields = line.splitn(3, char::is_whitespace);
        let (Some(name), Some(version), Some(origin)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed(member, line_no, line));
        };
        let origin = origin.trim();
        if version.is_empty() || origin.is_empty() {
            return Err(malformed(member, line_no, line));
        }
        out.push(ForeignRecord {
            name: name.to_string(),
            version: version.to_string(),
            origin: origin.to_string(),
        });
    }
    Ok(out)
}

/// Split a member into three-field records, keeping 1-based line numbers
fn records_of<'a>(member: &str, data: &'a [u8]) -> Result<Vec<(usize, [&'a str; 3])>> {
    let mut out = Vec::new();
    for (line_no, line) in content_lines(member, data)? {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [a, b, c] => out.push((line_no, [*a, *b, *c])),
            _ => return Err(malformed(member, line_no, line)),
        }
    }
    Ok(out)
}

/// Non-blank, non-comment lines (trimmed) with 1-based line numbers
fn content_lines<'a>(member: &str, data: &'a [u8]) -> Result<Vec<(usize, &'a str)>> {
    let text = std::str::from_utf8(data).map_err(|e| Error::MalformedRecord {
        member: member.to_string(),
        line: 0,
        content: format!("invalid UTF-8: {}", e),
    })?;

    Ok(text
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .collect())
}

fn malformed(member: &str, line: usize, content: &str) -> Error {
    Error::MalformedRecord {
        member: member.to_string(),
        line,
        content: content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMBER: &str = "var/lib/apt-clone/installed.pkgs";

    #[test]
    fn test_round_trip_keeps_order() {
        let records = vec![
            PackageRecord::new("zsh", "5.9-4", false),
            PackageRecord::new("libc6", "2.36-9", true),
            PackageRecord::new("apt", "2.6.1", false),
        ];
        let decoded = decode(MEMBER, &encode(&records)).unwrap();
        assert_eq!(decoded.records, records);
        assert_eq!(decoded.auto_installed_count(), 1);
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let data = b"# captured by apt-clone\n\nfoo 1.0 0\n   \n# trailing\nbar 2:1.2-3 1\n";
        let selection = decode(MEMBER, data).unwrap();
        assert_eq!(selection.len(), 2);
        assert_eq!(selection.get("bar").unwrap().version, "2:1.2-3");
        assert!(selection.get("bar").unwrap().auto_installed);
    }

    #[test]
    fn test_malformed_line_reports_position() {
        let data = b"foo 1.0 0\nbar 1.0\n";
        match decode(MEMBER, data) {
            Err(Error::MalformedRecord { member, line, content }) => {
                assert_eq!(member, MEMBER);
                assert_eq!(line, 2);
                assert_eq!(content, "bar 1.0");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        assert!(decode(MEMBER, b"foo 1.0 0 extra\n").is_err());
        assert!(decode(MEMBER, b"foo 1.0 yes\n").is_err());
    }

    #[test]
    fn test_foreign_records_default_origin() {
        let records = vec![
            ForeignRecord {
                name: "google-chrome-stable".to_string(),
                version: "120.0".to_string(),
                origin: "Google LLC".to_string(),
            },
            ForeignRecord {
                name: "local-tool".to_string(),
                version: "0.1".to_string(),
                origin: String::new(),
            },
        ];
        let encoded = encode_foreign(&records);
        assert!(String::from_utf8_lossy(&encoded).ends_with("local-tool 0.1 unknown\n"));

        let decoded = decode_foreign("foreign.pkgs", &encoded).unwrap();
        assert_eq!(decoded[0].origin, "Google LLC");
        assert_eq!(decoded[1].origin, UNKNOWN_ORIGIN);
    }
}

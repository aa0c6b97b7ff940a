// src/report/info.rs

//! Archive summary

use crate::archive::{CloneArchive, members};
use crate::error::Result;
use crate::host::{HostInfo, UNKNOWN};
use crate::selection;
use crate::sources::SourceList;
use chrono::{DateTime, Local, TimeZone};
use std::fmt;

/// Summary of one clone archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneInfo {
    pub hostname: String,
    pub arch: String,
    pub distro: String,
    /// Installed `*-desktop` meta packages
    pub meta: Vec<String>,
    pub installed: usize,
    pub auto_installed: usize,
    /// When the package list was written
    pub date: Option<DateTime<Local>>,
}

/// Summarise `archive`
pub fn clone_info(archive: &CloneArchive) -> Result<CloneInfo> {
    let data = archive.read(members::INSTALLED_PKGS)?;
    let packages = selection::decode(members::INSTALLED_PKGS, &data)?;

    let host = archive
        .read_optional(members::UNAME)?
        .map(|data| HostInfo::decode(&data))
        .unwrap_or_default();

    let distro = match archive.read_optional(members::SOURCES_LIST)? {
        Some(data) => SourceList::parse(members::SOURCES_LIST, &String::from_utf8_lossy(&data))
            .guess_distro(),
        None => None,
    };

    let date = archive
        .member(members::INSTALLED_PKGS)
        .and_then(|m| Local.timestamp_opt(m.mtime as i64, 0).single());

    Ok(CloneInfo {
        hostname: host.hostname,
        arch: host.arch,
        distro: distro.unwrap_or_else(|| UNKNOWN.to_string()),
        meta: packages
            .iter()
            .filter(|r| r.name.ends_with("-desktop"))
            .map(|r| r.name.clone())
            .collect(),
        installed: packages.len(),
        auto_installed: packages.auto_installed_count(),
        date,
    })
}

impl fmt::Display for CloneInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Hostname: {}", self.hostname)?;
        writeln!(f, "Arch: {}", self.arch)?;
        writeln!(f, "Distro: {}", self.distro)?;
        writeln!(f, "Meta: {}", self.meta.join(", "))?;
        writeln!(
            f,
            "Installed: {} pkgs ({} automatic)",
            self.installed, self.auto_installed
        )?;
        match &self.date {
            Some(date) => writeln!(f, "Date: {}", date.format("%a %b %e %H:%M:%S %Y")),
            None => writeln!(f, "Date: {}", UNKNOWN),
        }
    }
}

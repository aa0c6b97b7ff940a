// src/report/diff.rs

//! Differences between a clone archive and a live system

use super::conffiles::modified_conffiles;
use crate::archive::{CloneArchive, members};
use crate::config::CloneConfig;
use crate::dpkg;
use crate::error::{Error, Result};
use crate::host::HostInfo;
use crate::selection;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::PathBuf;

/// A host fact that differs between clone and system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoDifference {
    pub key: String,
    pub clone: String,
    pub system: String,
}

/// A package installed in both places at different versions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDifference {
    pub name: String,
    pub clone_version: String,
    pub system_version: String,
}

/// Everything `show-diff` reports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneDiff {
    pub info: Vec<InfoDifference>,
    /// Unified diff from the system sources.list to the archived one
    pub sources: Option<String>,
    pub only_on_system: BTreeSet<String>,
    pub only_in_clone: BTreeSet<String>,
    pub versions: Vec<VersionDifference>,
    /// Present when the conffile audit was requested
    pub conffiles: Option<BTreeSet<PathBuf>>,
}

impl CloneDiff {
    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
            && self.sources.is_none()
            && self.only_on_system.is_empty()
            && self.only_in_clone.is_empty()
            && self.versions.is_empty()
            && self.conffiles.as_ref().is_none_or(BTreeSet::is_empty)
    }
}

/// Compare `archive` against the system described by `config`
///
/// Nothing on the system is modified.
pub fn show_diff(
    archive: &CloneArchive,
    config: &CloneConfig,
    host: &HostInfo,
    with_conffiles: bool,
) -> Result<CloneDiff> {
    let clone_host = archive
        .read_optional(members::UNAME)?
        .map(|data| HostInfo::decode(&data))
        .unwrap_or_default();
    let info = host
        .fields()
        .into_iter()
        .zip(clone_host.fields())
        .filter(|((_, system), (_, clone))| system != clone)
        .map(|((key, system), (_, clone))| InfoDifference {
            key: key.to_string(),
            clone: clone.to_string(),
            system: system.to_string(),
        })
        .collect();

    let sources = sources_diff(archive, config)?;

    let data = archive.read(members::INSTALLED_PKGS)?;
    let in_clone: BTreeMap<String, String> = selection::decode(members::INSTALLED_PKGS, &data)?
        .records
        .into_iter()
        .map(|r| (r.name, r.version))
        .collect();
    let on_system: BTreeMap<String, String> = dpkg::read_status(&config.status_file)?
        .into_iter()
        .filter(dpkg::StatusEntry::is_installed)
        .map(|e| (e.package, e.version))
        .collect();

    let only_on_system = on_system
        .keys()
        .filter(|name| !in_clone.contains_key(*name))
        .cloned()
        .collect();
    let only_in_clone = in_clone
        .keys()
        .filter(|name| !on_system.contains_key(*name))
        .cloned()
        .collect();
    let versions = in_clone
        .iter()
        .filter_map(|(name, clone_version)| {
            let system_version = on_system.get(name)?;
            (system_version != clone_version).then(|| VersionDifference {
                name: name.clone(),
                clone_version: clone_version.clone(),
                system_version: system_version.clone(),
            })
        })
        .collect();

    let conffiles = if with_conffiles {
        Some(modified_conffiles(&config.root, &config.status_file)?)
    } else {
        None
    };

    Ok(CloneDiff {
        info,
        sources,
        only_on_system,
        only_in_clone,
        versions,
        conffiles,
    })
}

fn sources_diff(archive: &CloneArchive, config: &CloneConfig) -> Result<Option<String>> {
    let Some(clone) = archive.read_optional(members::SOURCES_LIST)? else {
        return Ok(None);
    };
    let clone = String::from_utf8_lossy(&clone);
    let system = if config.sources_list.exists() {
        fs::read_to_string(&config.sources_list)
            .map_err(|e| Error::io_at(&config.sources_list, e))?
    } else {
        String::new()
    };

    let patch = diffy::create_patch(&system, &clone);
    if patch.hunks().is_empty() {
        return Ok(None);
    }
    // diffy names the sides "original" and "modified"; use the real paths
    let body: Vec<String> = patch.to_string().lines().skip(2).map(str::to_string).collect();
    Ok(Some(format!(
        "--- current-system{}\n+++ {}\n{}\n",
        config.sources_list.display(),
        config.sources_list.display(),
        body.join("\n")
    )))
}

impl fmt::Display for CloneDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Clone info differences:")?;
        for diff in &self.info {
            writeln!(f, " '{}': clone='{}' system='{}'", diff.key, diff.clone, diff.system)?;
        }
        writeln!(f)?;

        if let Some(sources) = &self.sources {
            writeln!(f, "{}", sources)?;
        }

        if !self.only_on_system.is_empty() {
            writeln!(f, "Installed on the system but not in the clone-file:")?;
            writeln!(f, "{}", join(&self.only_on_system))?;
            writeln!(f)?;
        }
        if !self.only_in_clone.is_empty() {
            writeln!(f, "Installed in the clone-file but not in the system:")?;
            writeln!(f, "{}", join(&self.only_in_clone))?;
            writeln!(f)?;
        }
        if !self.versions.is_empty() {
            writeln!(f, "Version differences:")?;
            writeln!(f, "Pkgname <clone-file-version> <system-version>")?;
            for diff in &self.versions {
                writeln!(
                    f,
                    " {}  <{}>   <{}>",
                    diff.name, diff.clone_version, diff.system_version
                )?;
            }
        }
        if let Some(conffiles) = &self.conffiles
            && !conffiles.is_empty()
        {
            writeln!(f)?;
            writeln!(f, "Modified conffiles:")?;
            for path in conffiles {
                writeln!(f, " {}", path.display())?;
            }
        }
        Ok(())
    }
}

fn join(names: &BTreeSet<String>) -> String {
    names.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
}

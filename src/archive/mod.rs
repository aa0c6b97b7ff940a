// src/archive/mod.rs

//! Clone archive container
//!
//! A clone state file is a gzip-compressed tar archive holding typed, named
//! members (package list, repository configuration, keyrings, extra files,
//! repacked debs). Archives written by this crate store every member under
//! a `./` prefix; older archives store bare names. The convention is
//! probed once when the archive is opened and all lookups go through
//! logical (prefix-free) member names afterwards.

mod writer;

pub use writer::ArchiveWriter;

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::debug;

/// Logical member names inside a clone archive
pub mod members {
    /// Installed packages: `name version auto` per line (required)
    pub const INSTALLED_PKGS: &str = "var/lib/apt-clone/installed.pkgs";
    /// Packages whose origin differs from the host vendor
    pub const FOREIGN_PKGS: &str = "var/lib/apt-clone/foreign.pkgs";
    /// Host identity of the captured system
    pub const UNAME: &str = "var/lib/apt-clone/uname";
    /// Mirror of apt's auto-install bookkeeping
    pub const EXTENDED_STATES: &str = "var/lib/apt-clone/extended_states";
    /// Full dpkg status snapshot, kept for debugging
    pub const DPKG_STATUS: &str = "var/lib/apt-clone/dpkg-status";
    /// Directory of locally repacked debs
    pub const DEBS_DIR: &str = "var/lib/apt-clone/debs";
    /// Repository list (required)
    pub const SOURCES_LIST: &str = "etc/apt/sources.list";
    pub const SOURCES_PARTS: &str = "etc/apt/sources.list.d";
    pub const PREFERENCES: &str = "etc/apt/preferences";
    pub const PREFERENCES_PARTS: &str = "etc/apt/preferences.d";
    pub const TRUSTED: &str = "etc/apt/trusted.gpg";
    pub const TRUSTED_PARTS: &str = "etc/apt/trusted.gpg.d";
    /// Arbitrary user files, stored under their absolute path
    pub const EXTRA_FILES: &str = "extra-files";
}

/// Path-prefix convention of an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathPrefix {
    /// `./var/lib/apt-clone/installed.pkgs`
    #[default]
    Dot,
    /// `var/lib/apt-clone/installed.pkgs` (legacy archives)
    Bare,
}

impl PathPrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dot => "./",
            Self::Bare => "",
        }
    }

    /// Probe the convention from the lexicographically-last member name
    pub fn detect<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        match names.into_iter().max() {
            Some(last) if last.starts_with("./") => Self::Dot,
            _ => Self::Bare,
        }
    }

    /// Raw archive name for a logical member name
    pub fn apply(&self, logical: &str) -> String {
        format!("{}{}", self.as_str(), logical.trim_start_matches("./"))
    }
}

/// Kind of an archive member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// Metadata of one archive member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    /// Logical name (prefix stripped)
    pub name: String,
    pub size: u64,
    /// Modification time, seconds since the epoch
    pub mtime: u64,
    pub kind: MemberKind,
}

/// A clone archive opened for reading
///
/// The member table is read once at open time; member contents are
/// streamed from disk on demand.
#[derive(Debug, Clone)]
pub struct CloneArchive {
    path: PathBuf,
    prefix: PathPrefix,
    members: Vec<MemberInfo>,
}

impl CloneArchive {
    /// Open a clone archive and probe its path-prefix convention
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(Error::ArchiveNotFound(path.display().to_string()));
        }

        let mut raw = Vec::new();
        let mut archive = open_tar(&path)?;
        for entry in archive.entries().map_err(|e| corrupt(&path, e))? {
            let entry = entry.map_err(|e| corrupt(&path, e))?;
            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let header = entry.header();
            let kind = match header.entry_type() {
                EntryType::Regular | EntryType::Continuous => MemberKind::File,
                EntryType::Directory => MemberKind::Directory,
                EntryType::Symlink | EntryType::Link => MemberKind::Symlink,
                _ => MemberKind::Other,
            };
            let size = header.size().map_err(|e| corrupt(&path, e))?;
            let mtime = header.mtime().unwrap_or(0);
            raw.push((name, size, mtime, kind));
        }

        if raw.is_empty() {
            return Err(Error::ArchiveCorrupt(format!(
                "{}: archive has no members",
                path.display()
            )));
        }

        let prefix = PathPrefix::detect(raw.iter().map(|(name, ..)| name.as_str()));
        debug!(
            "Opened {} ({} members, prefix {:?})",
            path.display(),
            raw.len(),
            prefix.as_str()
        );

        let members = raw
            .into_iter()
            .filter_map(|(name, size, mtime, kind)| {
                let logical = logical_name(&name);
                (!logical.is_empty()).then(|| MemberInfo {
                    name: logical,
                    size,
                    mtime,
                    kind,
                })
            })
            .collect();

        Ok(Self {
            path,
            prefix,
            members,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path-prefix convention detected at open time
    pub fn prefix(&self) -> PathPrefix {
        self.prefix
    }

    pub fn members(&self) -> &[MemberInfo] {
        &self.members
    }

    pub fn member(&self, name: &str) -> Option<&MemberInfo> {
        let name = logical_name(name);
        self.members.iter().find(|m| m.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.member(name).is_some()
    }

    /// Logical names of members at or below `dir`
    pub fn members_under(&self, dir: &str) -> Vec<&MemberInfo> {
        let dir = logical_name(dir);
        self.members
            .iter()
            .filter(|m| is_under(&m.name, &dir))
            .collect()
    }

    /// Read the content of a required member
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.read_optional(name)?
            .ok_or_else(|| Error::MemberNotFound(logical_name(name)))
    }

    /// Read the content of a member that may be absent
    pub fn read_optional(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let wanted = logical_name(name);
        // Directories may be present only implicitly, through their children
        if self.members_under(&wanted).is_empty() {
            return Ok(None);
        }

        let mut archive = open_tar(&self.path)?;
        for entry in archive.entries().map_err(|e| corrupt(&self.path, e))? {
            let mut entry = entry.map_err(|e| corrupt(&self.path, e))?;
            if logical_name(&String::from_utf8_lossy(&entry.path_bytes())) != wanted {
                continue;
            }
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|e| corrupt(&self.path, e))?;
            return Ok(Some(content));
        }
        Ok(None)
    }

    /// Extract a required member (and, for directories, everything below it)
    /// into `dest_root`, returning the extracted path
    pub fn extract(&self, name: &str, dest_root: &Path) -> Result<PathBuf> {
        self.extract_optional(name, dest_root)?
            .ok_or_else(|| Error::MemberNotFound(logical_name(name)))
    }

    /// Like [`extract`](Self::extract), returning `None` when the member is absent
    pub fn extract_optional(&self, name: &str, dest_root: &Path) -> Result<Option<PathBuf>> {
        let wanted = logical_name(name);
        // Directories may be present only implicitly, through their children
        if self.members_under(&wanted).is_empty() {
            return Ok(None);
        }
        self.extract_matching(dest_root, |logical| {
            is_under(logical, &wanted).then(|| logical.to_string())
        })?;
        Ok(Some(dest_root.join(&wanted)))
    }

    /// Extract every member below `dir`, with `dir` itself stripped from the
    /// destination path
    pub fn extract_stripped(&self, dir: &str, dest_root: &Path) -> Result<Vec<PathBuf>> {
        let dir = logical_name(dir);
        let strip = format!("{}/", dir);
        self.extract_matching(dest_root, |logical| {
            logical.strip_prefix(&strip).map(str::to_string)
        })
    }

    /// Extract members selected by `map`, which turns a logical member name
    /// into a destination path relative to `dest_root`
    fn extract_matching<F>(&self, dest_root: &Path, map: F) -> Result<Vec<PathBuf>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut extracted = Vec::new();
        fs::create_dir_all(dest_root).map_err(|e| Error::io_at(dest_root, e))?;
        let real_root = fs::canonicalize(dest_root).map_err(|e| Error::io_at(dest_root, e))?;
        let mut archive = open_tar(&self.path)?;
        archive.set_preserve_permissions(true);

        for entry in archive.entries().map_err(|e| corrupt(&self.path, e))? {
            let mut entry = entry.map_err(|e| corrupt(&self.path, e))?;
            let logical = logical_name(&String::from_utf8_lossy(&entry.path_bytes()));
            let Some(relative) = map(&logical) else {
                continue;
            };
            if relative.is_empty() {
                continue;
            }
            if !is_safe_relative(Path::new(&relative)) {
                return Err(Error::ArchiveCorrupt(format!(
                    "{}: unsafe member path {}",
                    self.path.display(),
                    logical
                )));
            }

            let entry_type = entry.header().entry_type();
            if entry_type.is_hard_link() {
                return Err(Error::ArchiveCorrupt(format!(
                    "{}: hard link member {} is not supported",
                    self.path.display(),
                    logical
                )));
            }

            let target = dest_root.join(&relative);
            // Earlier symlink members must not redirect writes out of the root
            let checked = match target.parent() {
                Some(parent) if !entry_type.is_dir() => parent,
                _ => target.as_path(),
            };
            if !resolves_under(&real_root, checked) {
                return Err(Error::ArchiveCorrupt(format!(
                    "{}: member {} escapes {}",
                    self.path.display(),
                    logical,
                    dest_root.display()
                )));
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
            }
            debug!("Extracting {} -> {}", logical, target.display());
            entry.unpack(&target).map_err(|e| Error::io_at(&target, e))?;
            extracted.push(target);
        }
        Ok(extracted)
    }
}

fn open_tar(path: &Path) -> Result<Archive<GzDecoder<BufReader<File>>>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::ArchiveNotFound(path.display().to_string()),
        _ => Error::io_at(path, e),
    })?;
    Ok(Archive::new(GzDecoder::new(BufReader::new(file))))
}

fn corrupt(path: &Path, err: std::io::Error) -> Error {
    Error::ArchiveCorrupt(format!("{}: {}", path.display(), err))
}

/// Strip the `./` prefix and trailing slashes from a member name
pub(crate) fn logical_name(name: &str) -> String {
    let mut name = name;
    while let Some(rest) = name.strip_prefix("./") {
        name = rest;
    }
    if name == "." {
        return String::new();
    }
    name.trim_end_matches('/').to_string()
}

fn is_under(name: &str, dir: &str) -> bool {
    name == dir
        || name
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn is_safe_relative(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Whether the closest existing ancestor of `path` lies inside `real_root`
/// once symlinks are followed
fn resolves_under(real_root: &Path, path: &Path) -> bool {
    path.ancestors()
        .find_map(|p| fs::canonicalize(p).ok())
        .is_some_and(|real| real.starts_with(real_root))
}

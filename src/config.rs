// src/config.rs

//! Explicit configuration for capture and restore operations
//!
//! Every path an operation touches is carried in a [`CloneConfig`] value
//! that is passed into the operation. Nothing is read from process-wide
//! mutable state, so two configs for two different roots can be used side
//! by side (the simulated restore relies on this).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Default location of the optional configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/apt-clone/config.toml";

/// Environment variable that turns on verbose resolver diagnostics; the
/// binary applies it on top of the loaded configuration
pub const DEBUG_RESOLVER_ENV: &str = "APT_CLONE_DEBUG_RESOLVER";

/// Paths and host facts for one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneConfig {
    /// Root of the system being captured or restored
    pub root: PathBuf,
    /// dpkg status database
    pub status_file: PathBuf,
    /// apt auto-install bookkeeping
    pub extended_states: PathBuf,
    /// Main repository list
    pub sources_list: PathBuf,
    /// Directory of additional `*.list` files
    pub sources_parts: PathBuf,
    /// apt pinning preferences
    pub preferences: PathBuf,
    pub preferences_parts: PathBuf,
    /// Legacy single-file keyring
    pub trusted: PathBuf,
    pub trusted_parts: PathBuf,
    /// Debian architecture name (amd64, arm64, ...)
    pub architecture: String,
    /// Vendor id of the host distribution (`ID=` in os-release)
    pub distro_id: String,
    /// Codename of the host distribution, when known
    pub distro_codename: Option<String>,
    /// dpkg-repack helper used to rebuild not-downloadable packages
    pub dpkg_repack: PathBuf,
    /// fakeroot helper used when repacking without root privileges
    pub fakeroot: PathBuf,
    /// Pass problem-resolver debug options to apt
    pub debug_resolver: bool,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self::for_root("/")
    }
}

impl CloneConfig {
    /// Derive every path below `root`, detecting host facts from that root
    pub fn for_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let os_release = read_os_release(&root);
        Self {
            status_file: root.join("var/lib/dpkg/status"),
            extended_states: root.join("var/lib/apt/extended_states"),
            sources_list: root.join("etc/apt/sources.list"),
            sources_parts: root.join("etc/apt/sources.list.d"),
            preferences: root.join("etc/apt/preferences"),
            preferences_parts: root.join("etc/apt/preferences.d"),
            trusted: root.join("etc/apt/trusted.gpg"),
            trusted_parts: root.join("etc/apt/trusted.gpg.d"),
            architecture: detect_architecture(),
            distro_id: os_release.id.unwrap_or_else(|| "unknown".to_string()),
            distro_codename: os_release.codename,
            dpkg_repack: PathBuf::from("/usr/bin/dpkg-repack"),
            fakeroot: PathBuf::from("/usr/bin/fakeroot"),
            debug_resolver: false,
            root,
        }
    }

    /// Load a TOML configuration file and apply it on top of the defaults
    /// for the root it names (or `/`)
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_for_root(path, None)
    }

    /// Like [`load`](Self::load), with `root` taking precedence over the
    /// file's own root
    pub fn load_for_root(path: &Path, root: Option<&Path>) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io_at(path, e))?;
        let file: ConfigFile = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("{}: {}", path.display(), e)))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(file.apply(root))
    }

    /// Same config, re-rooted at `root` (explicit overrides are kept)
    pub fn with_root(&self, root: impl AsRef<Path>) -> Self {
        let mut rerooted = Self::for_root(root);
        rerooted.architecture = self.architecture.clone();
        rerooted.dpkg_repack = self.dpkg_repack.clone();
        rerooted.fakeroot = self.fakeroot.clone();
        rerooted.debug_resolver = self.debug_resolver;
        rerooted
    }

    /// Whether this config addresses the running system
    pub fn is_host_root(&self) -> bool {
        self.root == Path::new("/")
    }
}

/// On-disk configuration; every key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub root: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
    pub extended_states: Option<PathBuf>,
    pub architecture: Option<String>,
    pub distro_id: Option<String>,
    pub distro_codename: Option<String>,
    pub dpkg_repack: Option<PathBuf>,
    pub fakeroot: Option<PathBuf>,
    pub debug_resolver: Option<bool>,
}

impl ConfigFile {
    /// Build a full config; `root` wins over the file's own root
    pub fn apply(self, root: Option<&Path>) -> CloneConfig {
        let root = root
            .map(Path::to_path_buf)
            .or(self.root)
            .unwrap_or_else(|| PathBuf::from("/"));
        let mut config = CloneConfig::for_root(&root);
        if let Some(status) = self.status_file {
            config.status_file = status;
        }
        if let Some(states) = self.extended_states {
            config.extended_states = states;
        }
        if let Some(arch) = self.architecture {
            config.architecture = arch;
        }
        if let Some(id) = self.distro_id {
            config.distro_id = id;
        }
        if self.distro_codename.is_some() {
            config.distro_codename = self.distro_codename;
        }
        if let Some(repack) = self.dpkg_repack {
            config.dpkg_repack = repack;
        }
        if let Some(fakeroot) = self.fakeroot {
            config.fakeroot = fakeroot;
        }
        if let Some(debug) = self.debug_resolver {
            config.debug_resolver = debug;
        }
        config
    }
}

#[derive(Debug, Default)]
struct OsRelease {
    id: Option<String>,
    codename: Option<String>,
}

fn read_os_release(root: &Path) -> OsRelease {
    let mut release = OsRelease::default();
    let candidates = [root.join("etc/os-release"), root.join("usr/lib/os-release")];
    let Some(content) = candidates.iter().find_map(|p| fs::read_to_string(p).ok()) else {
        return release;
    };

    for line in content.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "ID" => release.id = Some(value),
                "VERSION_CODENAME" => release.codename = Some(value),
                "UBUNTU_CODENAME" if release.codename.is_none() => {
                    release.codename = Some(value)
                }
                _ => {}
            }
        }
    }
    release
}

/// Ask dpkg for the native architecture, falling back to the build target
pub fn detect_architecture() -> String {
    if let Ok(output) = Command::new("dpkg").arg("--print-architecture").output()
        && output.status.success()
    {
        let arch = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !arch.is_empty() {
            return arch;
        }
    }

    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "i386",
        "aarch64" => "arm64",
        "arm" => "armhf",
        "powerpc64" => "ppc64el",
        "riscv64" => "riscv64",
        "s390x" => "s390x",
        other => other,
    }
    .to_string()
}

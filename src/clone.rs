// src/clone.rs

//! Capture and restore orchestration
//!
//! [`AptClone`] ties the archive container, the replay engine and the
//! source-list rewriter together. It owns the two pluggable backends: the
//! [`SystemCommands`] used for OS tools and a factory that opens a
//! [`Resolver`] for a given root. Every operation receives its
//! [`CloneConfig`] explicitly.

use crate::archive::{ArchiveWriter, CloneArchive, members};
use crate::config::CloneConfig;
use crate::error::{Error, Result};
use crate::host::HostInfo;
use crate::replay::{ExcludeSpec, ReplayOptions, replay};
use crate::report::{self, CloneDiff, CloneInfo};
use crate::resolver::{AptResolver, Resolver};
use crate::scrub;
use crate::selection::{self, ForeignRecord, PackageRecord, PackageSelection};
use crate::sources::{self, SourceList};
use crate::system::{BindMountGuard, HostCommands, SystemCommands};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Opens a resolver for the root a config points at
pub type ResolverFactory = Box<dyn Fn(&CloneConfig) -> Result<Box<dyn Resolver>>>;

/// Options for [`AptClone::save_state`]
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Repack not-downloadable packages into the archive
    pub with_dpkg_repack: bool,
    /// Include the full dpkg status database
    pub with_dpkg_status: bool,
    /// Replace `user:password@` in repository URIs
    pub scrub_sources: bool,
    /// Globs of additional files to store under `extra-files/`
    pub extra_files: Vec<String>,
}

/// What a capture recorded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub archive_path: PathBuf,
    pub packages: usize,
    pub not_downloadable: BTreeSet<String>,
    pub version_mismatch: BTreeSet<String>,
    pub foreign: Vec<ForeignRecord>,
    /// Packages stored as repacked debs
    pub repacked: Vec<String>,
}

/// Options for restore and simulate
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Package name globs to skip
    pub exclude: Vec<String>,
    pub protect_installed: bool,
    /// Codename to rewrite the restored sources for
    pub new_distro: Option<String>,
    /// Replace every repository URI with this mirror
    pub mirror: Option<String>,
}

/// Outcome of a restore or simulated restore
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub missing: BTreeSet<String>,
    pub excluded: usize,
}

/// Capture/restore engine
pub struct AptClone<C: SystemCommands = HostCommands> {
    commands: C,
    resolvers: ResolverFactory,
}

impl AptClone<HostCommands> {
    /// Engine backed by the real system tools and apt
    pub fn new(config: &CloneConfig) -> Self {
        Self::with_backends(
            HostCommands::new(config),
            Box::new(|config: &CloneConfig| -> Result<Box<dyn Resolver>> {
                Ok(Box::new(AptResolver::open(config)?))
            }),
        )
    }
}

impl<C: SystemCommands> AptClone<C> {
    pub fn with_backends(commands: C, resolvers: ResolverFactory) -> Self {
        Self {
            commands,
            resolvers,
        }
    }

    pub fn commands(&self) -> &C {
        &self.commands
    }

    // --- capture -------------------------------------------------------

    /// Write the state of `config.root` into a clone archive
    pub fn save_state(
        &self,
        config: &CloneConfig,
        destination: &Path,
        options: &SaveOptions,
    ) -> Result<CaptureReport> {
        let host = HostInfo::current(&config.architecture)?;
        let target = archive_path(destination, &host.hostname);
        info!("Saving state of {} to {}", config.root.display(), target.display());

        let resolver = (self.resolvers)(config)?;
        let (selection, foreign) = capture_selection(resolver.as_ref(), &config.distro_id);

        let mut writer = ArchiveWriter::create(&target)?;
        writer.add_member(members::UNAME, &host.encode())?;
        writer.add_member(members::INSTALLED_PKGS, &selection::encode(&selection.records))?;
        writer.add_member(members::FOREIGN_PKGS, &selection::encode_foreign(&foreign))?;
        if config.extended_states.is_file() {
            writer.add_file(members::EXTENDED_STATES, &config.extended_states)?;
        }

        write_sources(&mut writer, config, options.scrub_sources)?;
        write_optional(&mut writer, members::PREFERENCES, &config.preferences, members::PREFERENCES_PARTS, &config.preferences_parts)?;
        write_optional(&mut writer, members::TRUSTED, &config.trusted, members::TRUSTED_PARTS, &config.trusted_parts)?;
        write_extra_files(&mut writer, &options.extra_files)?;

        if options.with_dpkg_status && config.status_file.is_file() {
            writer.add_file(members::DPKG_STATUS, &config.status_file)?;
        }

        let repacked = if options.with_dpkg_repack && !selection.not_downloadable.is_empty() {
            self.write_repacked(&mut writer, &selection.not_downloadable)?
        } else {
            Vec::new()
        };

        let archive_path = writer.finish()?;
        info!(
            "Saved {} packages ({} not downloadable, {} version mismatches)",
            selection.len(),
            selection.not_downloadable.len(),
            selection.version_mismatch.len()
        );
        Ok(CaptureReport {
            archive_path,
            packages: selection.len(),
            not_downloadable: selection.not_downloadable,
            version_mismatch: selection.version_mismatch,
            foreign,
            repacked,
        })
    }

    fn write_repacked(
        &self,
        writer: &mut ArchiveWriter,
        packages: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let workdir = TempDir::new()?;
        let mut repacked = Vec::new();
        for package in packages {
            match self.commands.repack_deb(package, workdir.path()) {
                Ok(()) => repacked.push(package.clone()),
                Err(Error::ToolMissing(tool)) => {
                    warn!("{} not available, not repacking installed packages", tool);
                    break;
                }
                Err(e) => warn!("Failed to repack {}: {}", package, e),
            }
        }
        if !repacked.is_empty() {
            writer.add_dir(members::DEBS_DIR, workdir.path(), true)?;
        }
        Ok(repacked)
    }

    // --- restore -------------------------------------------------------

    /// Restore the archive at `archive_path` into `config.root`
    pub fn restore_state(
        &self,
        archive_path: &Path,
        config: &CloneConfig,
        options: &RestoreOptions,
    ) -> Result<RestoreReport> {
        let archive = CloneArchive::open(archive_path)?;
        let selection = read_selection(&archive)?;
        let exclude = ExcludeSpec::new(&options.exclude)?;

        if !config.root.exists() {
            let distro = archive_distro(&archive)?
                .or_else(|| config.distro_codename.clone())
                .ok_or_else(|| {
                    Error::BootstrapFailed("cannot determine the distribution to bootstrap".to_string())
                })?;
            info!("{} does not exist, bootstrapping {}", config.root.display(), distro);
            self.commands.debootstrap(&config.root, &distro)?;
        }

        let _mounts = (!config.is_host_root())
            .then(|| BindMountGuard::mount(&self.commands, &config.root));

        restore_sources_list(&archive, config, options.mirror.as_deref())?;
        self.restore_keyring(&archive, config)?;
        if let Some(distro) = &options.new_distro {
            sources::rewrite_for_distro(&config.sources_list, &config.sources_parts, distro)?;
        }

        let mut resolver = (self.resolvers)(config)?;
        if let Err(e) = resolver.update() {
            warn!("Updating package indexes failed, continuing: {}", e);
        }
        let result = replay(
            &selection,
            resolver.as_mut(),
            &ReplayOptions {
                exclude,
                protect_installed: options.protect_installed,
            },
        );
        resolver.commit()?;

        self.restore_debs(&archive, config)?;
        // Extra files are restored after every package install
        let extra = archive.extract_stripped(members::EXTRA_FILES, &config.root)?;
        debug!("Restored {} extra files", extra.len());

        Ok(RestoreReport {
            missing: result.missing,
            excluded: result.excluded,
        })
    }

    /// Replay the archive against a throwaway copy of the host's package
    /// state and report what would be missing
    pub fn simulate_restore_state(
        &self,
        archive_path: &Path,
        host: &CloneConfig,
        options: &RestoreOptions,
    ) -> Result<RestoreReport> {
        let archive = CloneArchive::open(archive_path)?;
        let selection = read_selection(&archive)?;
        let exclude = ExcludeSpec::new(&options.exclude)?;

        let workdir = TempDir::new()?;
        let sim = host.with_root(workdir.path());
        seed_simulation_root(host, &sim)?;

        restore_sources_list(&archive, &sim, options.mirror.as_deref())?;
        archive.extract_stripped(members::TRUSTED_PARTS, &sim.trusted_parts)?;
        if let Some(distro) = &options.new_distro {
            sources::rewrite_for_distro(&sim.sources_list, &sim.sources_parts, distro)?;
        }

        let mut resolver = (self.resolvers)(&sim)?;
        if let Err(e) = resolver.update() {
            warn!("Updating package indexes failed, continuing: {}", e);
        }
        let result = replay(
            &selection,
            resolver.as_mut(),
            &ReplayOptions {
                exclude,
                protect_installed: options.protect_installed,
            },
        );

        Ok(RestoreReport {
            missing: result.missing,
            excluded: result.excluded,
        })
    }

    fn restore_keyring(&self, archive: &CloneArchive, config: &CloneConfig) -> Result<()> {
        let backup = sources::backup_path(&config.trusted);
        if config.trusted.is_file() {
            fs::copy(&config.trusted, &backup).map_err(|e| Error::io_at(&backup, e))?;
        }

        let replaced = match archive.read_optional(members::TRUSTED)? {
            Some(data) => {
                write_file(&config.trusted, &data)?;
                true
            }
            None => false,
        };
        archive.extract_stripped(members::TRUSTED_PARTS, &config.trusted_parts)?;

        if backup.exists() {
            if replaced && let Err(e) = self.commands.merge_keys(&backup, &config.trusted) {
                warn!("Failed to merge previous keyring: {}", e);
            }
            fs::remove_file(&backup).map_err(|e| Error::io_at(&backup, e))?;
        }
        Ok(())
    }

    fn restore_debs(&self, archive: &CloneArchive, config: &CloneConfig) -> Result<()> {
        let Some(dir) = archive.extract_optional(members::DEBS_DIR, &config.root)? else {
            return Ok(());
        };
        let mut debs: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(|e| Error::io_at(&dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "deb"))
            .collect();
        debs.sort();
        if debs.is_empty() {
            return Ok(());
        }

        info!("Installing {} repacked packages", debs.len());
        if let Err(e) = self.commands.install_debs(&debs, &config.root) {
            warn!("Installing repacked packages failed: {}", e);
        }
        Ok(())
    }

    // --- reports -------------------------------------------------------

    pub fn info(&self, archive_path: &Path) -> Result<CloneInfo> {
        report::clone_info(&CloneArchive::open(archive_path)?)
    }

    /// Compare an archive with the system at `config.root`
    pub fn show_diff(
        &self,
        archive_path: &Path,
        config: &CloneConfig,
        with_conffiles: bool,
    ) -> Result<CloneDiff> {
        let archive = CloneArchive::open(archive_path)?;
        let host = HostInfo::current(&config.architecture)?;
        report::show_diff(&archive, config, &host, with_conffiles)
    }
}

/// Where `save_state` writes for a destination argument
pub fn archive_path(destination: &Path, hostname: &str) -> PathBuf {
    if destination.is_dir() {
        return destination.join(format!("apt-clone-state-{}.tar.gz", hostname));
    }
    let name = destination.to_string_lossy();
    if name.ends_with(".tar.gz") {
        destination.to_path_buf()
    } else {
        PathBuf::from(format!("{}.apt-clone.tar.gz", name))
    }
}

/// Build the package records and diagnostics from a resolver's view
fn capture_selection(resolver: &dyn Resolver, distro_id: &str) -> (PackageSelection, Vec<ForeignRecord>) {
    let mut selection = PackageSelection::default();
    let mut foreign = Vec::new();

    for package in resolver.installed_packages() {
        match &package.candidate {
            Some(candidate) if candidate.downloadable => {
                if !package.installed_downloadable {
                    selection.version_mismatch.insert(package.name.clone());
                }
            }
            _ => {
                selection.not_downloadable.insert(package.name.clone());
            }
        }

        if let Some(origin) = package.origins.iter().find(|o| !o.is_local_status())
            && !origin.origin.eq_ignore_ascii_case(distro_id)
        {
            foreign.push(ForeignRecord {
                name: package.name.clone(),
                version: package.version.clone(),
                origin: origin.origin.clone(),
            });
        }

        selection.records.push(PackageRecord::new(
            package.name,
            package.version,
            package.auto_installed,
        ));
    }
    (selection, foreign)
}

fn read_selection(archive: &CloneArchive) -> Result<PackageSelection> {
    let data = archive.read(members::INSTALLED_PKGS)?;
    let selection = selection::decode(members::INSTALLED_PKGS, &data)?;
    if !archive.contains(members::SOURCES_LIST) {
        return Err(Error::MemberNotFound(members::SOURCES_LIST.to_string()));
    }
    Ok(selection)
}

fn archive_distro(archive: &CloneArchive) -> Result<Option<String>> {
    let data = archive.read(members::SOURCES_LIST)?;
    Ok(SourceList::parse(members::SOURCES_LIST, &String::from_utf8_lossy(&data)).guess_distro())
}

fn write_sources(writer: &mut ArchiveWriter, config: &CloneConfig, scrub: bool) -> Result<()> {
    if config.sources_list.is_file() {
        add_source_file(writer, members::SOURCES_LIST, &config.sources_list, scrub)?;
    } else {
        // deb822-only systems have no main list but the member is required
        writer.add_member(members::SOURCES_LIST, b"")?;
    }

    if !config.sources_parts.is_dir() {
        return Ok(());
    }
    writer.add_dir(members::SOURCES_PARTS, &config.sources_parts, false)?;
    for part in sources::list_parts(&config.sources_parts)? {
        let Some(name) = part.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let member = format!("{}/{}", members::SOURCES_PARTS, name);
        add_source_file(writer, &member, &part, scrub)?;
    }
    Ok(())
}

fn add_source_file(writer: &mut ArchiveWriter, member: &str, path: &Path, scrub: bool) -> Result<()> {
    if !scrub {
        return writer.add_file(member, path);
    }
    let content = fs::read(path).map_err(|e| Error::io_at(path, e))?;
    writer.add_member(member, &scrub::scrub(&content))
}

/// Add a single file and a parts directory when they exist
fn write_optional(
    writer: &mut ArchiveWriter,
    file_member: &str,
    file: &Path,
    dir_member: &str,
    dir: &Path,
) -> Result<()> {
    if file.is_file() {
        writer.add_file(file_member, file)?;
    }
    if dir.is_dir() {
        writer.add_dir(dir_member, dir, true)?;
    }
    Ok(())
}

fn write_extra_files(writer: &mut ArchiveWriter, patterns: &[String]) -> Result<()> {
    for pattern in patterns {
        let paths = glob::glob(pattern)
            .map_err(|e| Error::ConfigError(format!("Invalid extra-file glob '{}': {}", pattern, e)))?;
        for path in paths {
            let path = match path {
                Ok(path) => std::path::absolute(path)?,
                Err(e) => {
                    warn!("Skipping unreadable extra file: {}", e);
                    continue;
                }
            };
            let member = format!("{}{}", members::EXTRA_FILES, path.display());
            debug!("Adding extra file {}", path.display());
            if path.is_dir() {
                writer.add_dir(&member, &path, true)?;
            } else {
                writer.add_file(&member, &path)?;
            }
        }
    }
    Ok(())
}

/// Put the archived sources.list (and parts) in place on the target
fn restore_sources_list(archive: &CloneArchive, config: &CloneConfig, mirror: Option<&str>) -> Result<()> {
    sources::backup_existing(&config.sources_list)?;
    let data = archive.read(members::SOURCES_LIST)?;
    write_file(&config.sources_list, &data)?;
    sources::set_list_mode(&config.sources_list)?;

    if let Some(mirror) = mirror {
        let mut list = SourceList::load(&config.sources_list)?;
        list.set_mirror(mirror);
        list.save()?;
    }

    archive.extract_stripped(members::SOURCES_PARTS, &config.sources_parts)?;
    Ok(())
}

/// Copy the host's package state into a simulation root
fn seed_simulation_root(host: &CloneConfig, sim: &CloneConfig) -> Result<()> {
    for dir in [
        "var/lib/dpkg",
        "var/lib/apt/lists/partial",
        "var/cache/apt/archives/partial",
        "etc/apt/apt.conf.d",
        "etc/apt/preferences.d",
        "etc/apt/trusted.gpg.d",
    ] {
        let path = sim.root.join(dir);
        fs::create_dir_all(&path).map_err(|e| Error::io_at(&path, e))?;
    }

    if host.status_file.is_file() {
        copy_into(&host.status_file, &sim.status_file)?;
    } else {
        write_file(&sim.status_file, b"")?;
    }
    if host.trusted.is_file() {
        copy_into(&host.trusted, &sim.trusted)?;
    }
    for part in list_dir(&host.trusted_parts) {
        if let Some(name) = part.file_name() {
            copy_into(&part, &sim.trusted_parts.join(name))?;
        }
    }
    Ok(())
}

fn list_dir(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .collect()
        })
        .unwrap_or_default()
}

fn copy_into(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
    }
    fs::copy(from, to).map_err(|e| Error::io_at(to, e))?;
    Ok(())
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
    }
    fs::write(path, data).map_err(|e| Error::io_at(path, e))
}

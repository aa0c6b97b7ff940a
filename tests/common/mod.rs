// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use apt_clone::clone::ResolverFactory;
use apt_clone::resolver::{MemoryPackage, MemoryResolver, Resolver};
use apt_clone::system::RecordingCommands;
use apt_clone::{AptClone, ArchiveWriter, CloneConfig};
use std::fs;
use std::path::{Path, PathBuf};

pub const BOOKWORM_SOURCES: &str = "\
deb http://deb.debian.org/debian bookworm main contrib
deb http://deb.debian.org/debian bookworm-updates main contrib
deb http://security.debian.org/debian-security bookworm-security main
";

/// Lay out a minimal apt/dpkg tree under `root` and return its config.
///
/// The config reports a Debian host so foreign-origin checks have a
/// distribution to compare against.
pub fn fake_root(root: &Path) -> CloneConfig {
    let mut config = CloneConfig::for_root(root);
    config.distro_id = "debian".to_string();

    fs::create_dir_all(config.sources_parts.clone()).unwrap();
    fs::create_dir_all(config.preferences_parts.clone()).unwrap();
    fs::create_dir_all(config.trusted_parts.clone()).unwrap();
    fs::create_dir_all(config.status_file.parent().unwrap()).unwrap();
    fs::create_dir_all(config.extended_states.parent().unwrap()).unwrap();

    fs::write(&config.sources_list, BOOKWORM_SOURCES).unwrap();
    fs::write(
        &config.status_file,
        "Package: bash\nStatus: install ok installed\nVersion: 5.2.15-2\nArchitecture: amd64\n",
    )
    .unwrap();
    fs::write(
        &config.extended_states,
        "Package: libreadline8\nArchitecture: amd64\nAuto-Installed: 1\n",
    )
    .unwrap();
    fs::write(config.trusted_parts.join("debian-archive.gpg"), b"keyring").unwrap();
    config
}

/// Engine backed by recording commands and a copy of `resolver` per open
pub fn memory_engine(resolver: MemoryResolver) -> AptClone<RecordingCommands> {
    memory_engine_with(RecordingCommands::new(), resolver)
}

pub fn memory_engine_with(
    commands: RecordingCommands,
    resolver: MemoryResolver,
) -> AptClone<RecordingCommands> {
    AptClone::with_backends(commands, memory_factory(resolver))
}

pub fn memory_factory(resolver: MemoryResolver) -> ResolverFactory {
    Box::new(move |_config: &CloneConfig| -> apt_clone::Result<Box<dyn Resolver>> {
        Ok(Box::new(resolver.clone()))
    })
}

/// A small Debian universe: bash installed, an editor with a library
/// dependency available, and nothing else
pub fn bookworm_universe() -> MemoryResolver {
    MemoryResolver::with_packages([
        MemoryPackage::new("bash")
            .available("5.2.15-2")
            .installed("5.2.15-2")
            .origin("stable", "Debian"),
        MemoryPackage::new("vim")
            .available("9.0.1378-2")
            .depends(["libgpm2"])
            .origin("stable", "Debian"),
        MemoryPackage::new("libgpm2")
            .available("1.20.7-10")
            .origin("stable", "Debian"),
        MemoryPackage::new("linux-image-amd64")
            .available("6.1.0-13")
            .origin("stable", "Debian"),
    ])
}

/// Write a clone archive from `(logical name, content)` pairs
pub fn write_archive(path: &Path, members: &[(&str, &[u8])]) -> PathBuf {
    let mut writer = ArchiveWriter::create(path).unwrap();
    for (name, content) in members {
        writer.add_member(name, content).unwrap();
    }
    writer.finish().unwrap()
}

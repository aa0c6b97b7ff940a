// tests/new_distro.rs

//! Restoring onto a newer release rewrites and merges the repository lists.

mod common;

use apt_clone::archive::members;
use apt_clone::resolver::{MemoryPackage, MemoryResolver};
use apt_clone::RestoreOptions;
use common::{fake_root, memory_engine, write_archive};
use std::collections::BTreeSet;
use std::fs;
use tempfile::TempDir;

const LUCID: &str = "\
deb cdrom:[Ubuntu 10.04 LTS _Lucid Lynx_ - Release i386 (20100429)]/ lucid main restricted
deb http://archive.ubuntu.com/ubuntu/ lucid main restricted
deb http://archive.ubuntu.com/ubuntu/ lucid-updates main restricted
deb http://security.ubuntu.com/ubuntu lucid-security main restricted
";

const MAVERICK_LIVECD: &str = "\
deb cdrom:[Ubuntu 10.10 _Maverick Meerkat_ - Release i386 (20101007)]/ maverick main restricted
deb http://archive.ubuntu.com/ubuntu/ maverick main restricted
deb http://extras.ubuntu.com/ubuntu maverick main
";

fn maverick_universe() -> MemoryResolver {
    MemoryResolver::with_packages([
        MemoryPackage::new("ubuntu-desktop").available("1.201"),
        MemoryPackage::new("gedit").available("2.30.3"),
    ])
}

#[test]
fn test_restore_on_new_release_livecd() {
    let temp = TempDir::new().unwrap();
    let target = fake_root(&temp.path().join("target"));
    fs::write(&target.sources_list, MAVERICK_LIVECD).unwrap();
    fs::write(
        target.sources_parts.join("ppa.list"),
        "deb http://ppa.launchpad.net/someone/ppa/ubuntu lucid main\n",
    )
    .unwrap();

    let archive = write_archive(
        &temp.path().join("lucid.tar.gz"),
        &[
            (members::INSTALLED_PKGS, b"ubuntu-desktop 1.200 0\ngedit 2.30.0 0\nlucid-only-tool 0.1 0\n"),
            (members::SOURCES_LIST, LUCID.as_bytes()),
        ],
    );

    let report = memory_engine(maverick_universe())
        .restore_state(
            &archive,
            &target,
            &RestoreOptions {
                new_distro: Some("maverick".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(report.missing, BTreeSet::from(["lucid-only-tool".to_string()]));

    let sources = fs::read_to_string(&target.sources_list).unwrap();
    assert!(sources.contains("maverick"));
    assert!(!sources.contains(" lucid"));
    assert!(sources.contains("deb http://archive.ubuntu.com/ubuntu/ maverick-updates main restricted\n"));
    assert!(sources.contains("deb http://security.ubuntu.com/ubuntu maverick-security main restricted\n"));
    assert!(sources.contains("deb http://extras.ubuntu.com/ubuntu maverick main\n"));

    // Both cdrom lines lead the file, disabled
    let lines: Vec<&str> = sources.lines().collect();
    assert!(lines[0].starts_with("# deb cdrom:"));
    assert!(lines[1].starts_with("# deb cdrom:"));
    assert!(lines[2..].iter().all(|l| !l.contains("cdrom:")));

    // The archive's main entry and the livecd's equivalent appear once
    let main_entries = lines
        .iter()
        .filter(|l| **l == "deb http://archive.ubuntu.com/ubuntu/ maverick main restricted")
        .count();
    assert_eq!(main_entries, 1);
    assert!(!target.root.join("etc/apt/sources.list.apt-clone").exists());

    let ppa = fs::read_to_string(target.sources_parts.join("ppa.list")).unwrap();
    assert_eq!(ppa, "deb http://ppa.launchpad.net/someone/ppa/ubuntu maverick main\n");
}

#[test]
fn test_simulate_with_new_release() {
    let temp = TempDir::new().unwrap();
    let host = fake_root(&temp.path().join("host"));
    let archive = write_archive(
        &temp.path().join("lucid.tar.gz"),
        &[
            (members::INSTALLED_PKGS, b"ubuntu-desktop 1.200 0\nlucid-only-tool 0.1 0\n"),
            (members::SOURCES_LIST, LUCID.as_bytes()),
        ],
    );

    let report = memory_engine(maverick_universe())
        .simulate_restore_state(
            &archive,
            &host,
            &RestoreOptions {
                new_distro: Some("maverick".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(report.missing, BTreeSet::from(["lucid-only-tool".to_string()]));
    assert_eq!(fs::read_to_string(&host.sources_list).unwrap(), common::BOOKWORM_SOURCES);
}

#[test]
fn test_mirror_replaces_every_uri() {
    let temp = TempDir::new().unwrap();
    let target = fake_root(&temp.path().join("target"));
    let archive = write_archive(
        &temp.path().join("state.tar.gz"),
        &[
            (members::INSTALLED_PKGS, b"gedit 2.30.3 0\n"),
            (members::SOURCES_LIST, common::BOOKWORM_SOURCES.as_bytes()),
        ],
    );

    memory_engine(maverick_universe())
        .restore_state(
            &archive,
            &target,
            &RestoreOptions {
                mirror: Some("http://mirror.internal/debian".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    let sources = fs::read_to_string(&target.sources_list).unwrap();
    for line in sources.lines() {
        assert!(line.starts_with("deb http://mirror.internal/debian "), "{}", line);
    }
}

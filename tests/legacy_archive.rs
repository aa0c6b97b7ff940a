// tests/legacy_archive.rs

//! Archives written without the `./` member prefix read the same way.

mod common;

use apt_clone::archive::{PathPrefix, members};
use apt_clone::{ArchiveWriter, CloneArchive, Error, RestoreOptions};
use common::{BOOKWORM_SOURCES, bookworm_universe, fake_root, memory_engine};
use std::collections::BTreeSet;
use std::fs;
use tempfile::TempDir;

fn bare_archive(dir: &std::path::Path) -> std::path::PathBuf {
    let mut writer =
        ArchiveWriter::create_with_prefix(dir.join("legacy.tar.gz"), PathPrefix::Bare).unwrap();
    writer
        .add_member(members::INSTALLED_PKGS, b"vim 9.0.1378-2 0\nlibgpm2 1.20.7-10 1\nxfce4-desktop 4.18 0\n")
        .unwrap();
    writer.add_member(members::SOURCES_LIST, BOOKWORM_SOURCES.as_bytes()).unwrap();
    writer
        .add_member(members::UNAME, b"hostname: oldbox\nkernel: 5.10.0\nuname_arch: x86_64\narch: amd64\n")
        .unwrap();
    writer.add_member("extra-files/etc/issue", b"legacy\n").unwrap();
    writer.finish().unwrap()
}

#[test]
fn test_info_on_bare_archive() {
    let temp = TempDir::new().unwrap();
    let path = bare_archive(temp.path());

    let archive = CloneArchive::open(&path).unwrap();
    assert_eq!(archive.prefix(), PathPrefix::Bare);

    let info = memory_engine(bookworm_universe()).info(&path).unwrap();
    assert_eq!(info.hostname, "oldbox");
    assert_eq!(info.distro, "bookworm");
    assert_eq!(info.meta, vec!["xfce4-desktop"]);
    assert_eq!(info.installed, 3);
    assert_eq!(info.auto_installed, 1);
    assert!(info.date.is_some());
}

#[test]
fn test_restore_from_bare_archive() {
    let temp = TempDir::new().unwrap();
    let target = fake_root(&temp.path().join("target"));
    let path = bare_archive(temp.path());

    let report = memory_engine(bookworm_universe())
        .restore_state(&path, &target, &RestoreOptions::default())
        .unwrap();

    assert_eq!(report.missing, BTreeSet::from(["xfce4-desktop".to_string()]));
    assert_eq!(fs::read_to_string(target.root.join("etc/issue")).unwrap(), "legacy\n");
}

#[test]
fn test_unreadable_archives() {
    let temp = TempDir::new().unwrap();
    let engine = memory_engine(bookworm_universe());

    let err = engine.info(&temp.path().join("absent.tar.gz")).unwrap_err();
    assert!(matches!(err, Error::ArchiveNotFound(_)));

    let garbage = temp.path().join("garbage.tar.gz");
    fs::write(&garbage, b"this is not gzip").unwrap();
    let err = engine.info(&garbage).unwrap_err();
    assert!(matches!(err, Error::ArchiveCorrupt(_)));
}

#[test]
fn test_malformed_package_list() {
    let temp = TempDir::new().unwrap();
    let path = common::write_archive(
        &temp.path().join("bad.tar.gz"),
        &[
            (members::INSTALLED_PKGS, b"vim 9.0 0\nbroken-line\n"),
            (members::SOURCES_LIST, BOOKWORM_SOURCES.as_bytes()),
        ],
    );

    let err = memory_engine(bookworm_universe()).info(&path).unwrap_err();
    match err {
        Error::MalformedRecord { line, content, .. } => {
            assert_eq!(line, 2);
            assert_eq!(content, "broken-line");
        }
        other => panic!("unexpected error: {other}"),
    }
}

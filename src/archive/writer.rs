// src/archive/writer.rs

//! Writing clone archives

use super::PathPrefix;
use crate::error::{Error, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tar::{Builder, EntryType, Header};
use tracing::debug;
use walkdir::WalkDir;

/// Name used for GNU long-name records
const GNU_LONGLINK: &[u8] = b"././@LongLink";

/// Writes members into a new gzip-compressed clone archive
///
/// Member names are written byte-for-byte with the archive's prefix; the
/// tar crate's own path handling would normalise `./` away, which would
/// turn every new archive into a legacy one.
pub struct ArchiveWriter {
    path: PathBuf,
    prefix: PathPrefix,
    builder: Builder<GzEncoder<File>>,
}

impl ArchiveWriter {
    /// Create a new archive using the current `./` convention
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with_prefix(path, PathPrefix::Dot)
    }

    /// Create a new archive with an explicit prefix convention
    pub fn create_with_prefix(path: impl AsRef<Path>, prefix: PathPrefix) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| Error::io_at(&path, e))?;
        let encoder = GzEncoder::new(file, Compression::default());
        debug!("Creating clone archive {}", path.display());
        Ok(Self {
            path,
            prefix,
            builder: Builder::new(encoder),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add an in-memory member; size and mtime are taken now
    pub fn add_member(&mut self, name: &str, content: &[u8]) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(content.len() as u64);
        header.set_mtime(now());
        self.append(name, header, content)
    }

    /// Add a file from disk under `name`, keeping its mode and mtime
    pub fn add_file(&mut self, name: &str, source: &Path) -> Result<()> {
        let metadata = fs::metadata(source).map_err(|e| Error::io_at(source, e))?;
        let file = File::open(source).map_err(|e| Error::io_at(source, e))?;

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(metadata.permissions().mode() & 0o7777);
        header.set_size(metadata.len());
        header.set_mtime(metadata.mtime().max(0) as u64);
        self.append(name, header, file)
    }

    /// Add a directory entry for `source`; with `recursive`, every file and
    /// subdirectory below it follows in sorted order
    pub fn add_dir(&mut self, name: &str, source: &Path, recursive: bool) -> Result<()> {
        let metadata = fs::metadata(source).map_err(|e| Error::io_at(source, e))?;
        self.append_dir_entry(name, metadata.permissions().mode(), metadata.mtime())?;
        if !recursive {
            return Ok(());
        }

        let walker = WalkDir::new(source)
            .min_depth(1)
            .sort_by_file_name()
            .follow_links(false);
        for entry in walker {
            let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| Error::IoError(e.to_string()))?;
            let member = format!("{}/{}", name.trim_end_matches('/'), relative.display());

            let file_type = entry.file_type();
            if file_type.is_dir() {
                let meta = entry.metadata().map_err(|e| Error::IoError(e.to_string()))?;
                self.append_dir_entry(&member, meta.permissions().mode(), meta.mtime())?;
            } else if file_type.is_file() {
                self.add_file(&member, entry.path())?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path()).map_err(|e| Error::io_at(entry.path(), e))?;
                self.add_symlink(&member, &target)?;
            }
        }
        Ok(())
    }

    fn add_symlink(&mut self, name: &str, target: &Path) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        header.set_mtime(now());
        header
            .set_link_name(target)
            .map_err(|e| Error::IoError(format!("{}: {}", target.display(), e)))?;
        self.append(name, header, io::empty())
    }

    fn append_dir_entry(&mut self, name: &str, mode: u32, mtime: i64) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(mode & 0o7777);
        header.set_size(0);
        header.set_mtime(mtime.max(0) as u64);
        let name = format!("{}/", name.trim_end_matches('/'));
        self.append(&name, header, io::empty())
    }

    /// Write `header` + `data` with the raw prefixed name
    fn append<R: Read>(&mut self, name: &str, mut header: Header, data: R) -> Result<()> {
        let raw = self.prefix.apply(name);
        let bytes = raw.as_bytes();
        let slot_len = header.as_old().name.len();

        if bytes.len() > slot_len {
            let mut long = Header::new_gnu();
            long.as_old_mut().name[..GNU_LONGLINK.len()].copy_from_slice(GNU_LONGLINK);
            long.set_entry_type(EntryType::GNULongName);
            long.set_mode(0o644);
            long.set_size(bytes.len() as u64 + 1);
            long.set_mtime(0);
            long.set_cksum();
            self.builder
                .append(&long, bytes.chain(&[0u8][..]))
                .map_err(|e| Error::io_at(&self.path, e))?;
        }

        let copy_len = bytes.len().min(slot_len);
        let slot = &mut header.as_old_mut().name;
        slot.fill(0);
        slot[..copy_len].copy_from_slice(&bytes[..copy_len]);
        header.set_cksum();

        self.builder
            .append(&header, data)
            .map_err(|e| Error::io_at(&self.path, e))
    }

    /// Flush the tar trailer and the gzip stream
    pub fn finish(self) -> Result<PathBuf> {
        let encoder = self
            .builder
            .into_inner()
            .map_err(|e| Error::io_at(&self.path, e))?;
        encoder.finish().map_err(|e| Error::io_at(&self.path, e))?;
        Ok(self.path)
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{CloneArchive, MemberKind};
    use tempfile::TempDir;

    #[test]
    fn test_dot_prefix_is_kept() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.tar.gz");
        let mut writer = ArchiveWriter::create(&path).unwrap();
        writer.add_member("var/lib/apt-clone/installed.pkgs", b"foo 1.0 0\n").unwrap();
        writer.finish().unwrap();

        let file = File::open(&path).unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| String::from_utf8_lossy(&e.unwrap().path_bytes()).into_owned())
            .collect();
        assert_eq!(names, vec!["./var/lib/apt-clone/installed.pkgs"]);
    }

    #[test]
    fn test_long_member_names() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.tar.gz");
        let long_name = format!("var/lib/apt-clone/debs/{}_1.0-1_amd64.deb", "x".repeat(120));

        let mut writer = ArchiveWriter::create(&path).unwrap();
        writer.add_member(&long_name, b"!<arch>\n").unwrap();
        writer.finish().unwrap();

        let archive = CloneArchive::open(&path).unwrap();
        assert!(archive.contains(&long_name));
        assert_eq!(archive.read(&long_name).unwrap(), b"!<arch>\n");
    }

    #[test]
    fn test_add_dir_recursive() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("preferences.d");
        fs::create_dir_all(source.join("nested")).unwrap();
        fs::write(source.join("pin-firefox"), "Package: firefox\n").unwrap();
        fs::write(source.join("nested/other"), "x").unwrap();

        let path = temp.path().join("state.tar.gz");
        let mut writer = ArchiveWriter::create(&path).unwrap();
        writer.add_dir("etc/apt/preferences.d", &source, true).unwrap();
        writer.finish().unwrap();

        let archive = CloneArchive::open(&path).unwrap();
        let dir = archive.member("etc/apt/preferences.d").unwrap();
        assert_eq!(dir.kind, MemberKind::Directory);
        assert!(archive.contains("etc/apt/preferences.d/pin-firefox"));
        assert!(archive.contains("etc/apt/preferences.d/nested/other"));
        assert_eq!(archive.members_under("etc/apt/preferences.d").len(), 4);
    }

    #[test]
    fn test_member_mtime_recorded() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.tar.gz");
        let mut writer = ArchiveWriter::create(&path).unwrap();
        writer.add_member("var/lib/apt-clone/uname", b"hostname: box\n").unwrap();
        writer.finish().unwrap();

        let archive = CloneArchive::open(&path).unwrap();
        let member = archive.member("var/lib/apt-clone/uname").unwrap();
        assert_eq!(member.size, 14);
        assert!(member.mtime > 0);
    }
}

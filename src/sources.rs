// src/sources.rs

//! One-line-style apt repository lists
//!
//! Parsing keeps every line, including comments and lines that are not
//! repository entries, so a list can be rewritten and saved without losing
//! anything the administrator put there.

use crate::error::{Error, Result};
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Distribution pockets kept across a distro rewrite, in match order
pub const POCKETS: [&str; 3] = ["-updates", "-security", "-backports"];

/// Suffix of the copy of a target's own sources.list taken before restore
pub const BACKUP_SUFFIX: &str = ".apt-clone";

/// One line of a sources.list file
#[derive(Debug, Clone)]
pub struct SourceEntry {
    /// `deb` or `deb-src`
    pub kind: String,
    /// Content of a `[...]` options block
    pub options: Option<String>,
    pub uri: String,
    pub dist: String,
    pub components: Vec<String>,
    /// Commented out with a leading `#`
    pub disabled: bool,
    /// Not a repository line (blank, plain comment, garbage)
    pub invalid: bool,
    /// Trailing `# ...` comment
    pub comment: Option<String>,
    /// The line as read
    pub line: String,
}

impl SourceEntry {
    /// Parse a single line; anything unparseable becomes an invalid entry
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\n', '\r']).to_string();
        let mut entry = Self {
            kind: String::new(),
            options: None,
            uri: String::new(),
            dist: String::new(),
            components: Vec::new(),
            disabled: false,
            invalid: true,
            comment: None,
            line,
        };

        let mut text = entry.line.trim();
        if let Some(rest) = text.strip_prefix('#') {
            entry.disabled = true;
            text = rest.trim();
        }
        let body = match comment_start(text) {
            Some(at) => {
                entry.comment = Some(text[at + 1..].trim().to_string());
                text[..at].trim()
            }
            None => text,
        };

        let mut fields = split_fields(body).into_iter();
        let Some(kind) = fields.next() else {
            return entry;
        };
        if kind != "deb" && kind != "deb-src" {
            return entry;
        }
        let mut fields = fields.peekable();
        if let Some(options) = fields.next_if(|f| f.starts_with('[')) {
            let Some(inner) = options.strip_prefix('[').and_then(|o| o.strip_suffix(']')) else {
                return entry;
            };
            entry.options = Some(inner.trim().to_string());
        }

        let (Some(uri), Some(dist)) = (fields.next(), fields.next()) else {
            return entry;
        };
        entry.kind = kind;
        entry.uri = uri;
        entry.dist = dist;
        entry.components = fields.collect();
        entry.invalid = false;
        entry
    }

    /// Render the entry from its fields
    fn render(&self) -> String {
        let mut out = String::new();
        if self.disabled {
            out.push_str("# ");
        }
        out.push_str(&self.kind);
        if let Some(options) = &self.options {
            out.push_str(&format!(" [{}]", options));
        }
        out.push_str(&format!(" {} {}", self.uri, self.dist));
        for component in &self.components {
            out.push(' ');
            out.push_str(component);
        }
        if let Some(comment) = &self.comment {
            out.push_str(&format!(" #{}", comment));
        }
        out
    }

    fn same_fields(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.options == other.options
            && self.uri == other.uri
            && self.dist == other.dist
            && self.components == other.components
            && self.disabled == other.disabled
            && self.comment == other.comment
    }

    pub fn is_cdrom(&self) -> bool {
        self.uri.starts_with("cdrom:")
    }

    /// Replace the codename, keeping a recognised pocket suffix
    pub fn set_distro(&mut self, new_distro: &str) {
        self.dist = match POCKETS.iter().find(|p| self.dist.ends_with(*p)) {
            Some(pocket) => format!("{}{}", new_distro, pocket),
            None => new_distro.to_string(),
        };
    }
}

/// Entries compare like apt does: state, type, URI (ignoring a trailing
/// slash), distribution and components
impl PartialEq for SourceEntry {
    fn eq(&self, other: &Self) -> bool {
        if self.invalid || other.invalid {
            return self.invalid == other.invalid && self.line.trim() == other.line.trim();
        }
        self.disabled == other.disabled
            && self.kind == other.kind
            && self.uri.trim_end_matches('/') == other.uri.trim_end_matches('/')
            && self.dist == other.dist
            && self.components == other.components
    }
}

impl fmt::Display for SourceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.invalid || Self::parse(&self.line).same_fields(self) {
            write!(f, "{}", self.line)
        } else {
            write!(f, "{}", self.render())
        }
    }
}

/// An ordered sources.list file
#[derive(Debug, Clone)]
pub struct SourceList {
    pub path: PathBuf,
    pub entries: Vec<SourceEntry>,
}

impl SourceList {
    pub fn parse(path: impl Into<PathBuf>, content: &str) -> Self {
        Self {
            path: path.into(),
            entries: content.lines().map(SourceEntry::parse).collect(),
        }
    }

    /// Read a list; a missing file is an empty list
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::parse(path, ""));
        }
        let content = fs::read_to_string(path)
            .map_err(|e| Error::SourcesError(format!("{}: {}", path.display(), e)))?;
        Ok(Self::parse(path, &content))
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
        }
        fs::write(&self.path, self.to_string())
            .map_err(|e| Error::SourcesError(format!("{}: {}", self.path.display(), e)))?;
        debug!("Saved {} ({} lines)", self.path.display(), self.entries.len());
        Ok(())
    }

    pub fn contains(&self, entry: &SourceEntry) -> bool {
        self.entries.iter().any(|e| e == entry)
    }

    /// Enabled repository entries
    pub fn active(&self) -> impl Iterator<Item = &SourceEntry> {
        self.entries.iter().filter(|e| !e.invalid && !e.disabled)
    }

    /// Point every enabled entry at `new_distro`
    pub fn rewrite_distro(&mut self, new_distro: &str) {
        for entry in &mut self.entries {
            if entry.invalid || entry.disabled {
                continue;
            }
            entry.set_distro(new_distro);
        }
    }

    /// Append backup entries that would otherwise be lost, then delete the
    /// backup; returns the number of appended lines
    pub fn merge_backup(&mut self, backup: &Path) -> Result<usize> {
        if !backup.exists() {
            return Ok(0);
        }
        let content = fs::read_to_string(backup)
            .map_err(|e| Error::SourcesError(format!("{}: {}", backup.display(), e)))?;
        let mut appended = 0;
        for line in content.lines() {
            let entry = SourceEntry::parse(line);
            if entry.invalid || entry.disabled || !self.contains(&entry) {
                self.entries.push(entry);
                appended += 1;
            }
        }
        fs::remove_file(backup).map_err(|e| Error::io_at(backup, e))?;
        debug!("Merged {} lines from {}", appended, backup.display());
        Ok(appended)
    }

    /// Move cdrom entries to the top, disabled
    pub fn cdrom_first(&mut self) {
        let (mut cdrom, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.entries).into_iter().partition(|e| !e.invalid && e.is_cdrom());
        for entry in &mut cdrom {
            entry.disabled = true;
        }
        cdrom.extend(rest);
        self.entries = cdrom;
    }

    /// Point every enabled entry at a mirror URI
    pub fn set_mirror(&mut self, mirror: &str) {
        for entry in &mut self.entries {
            if !entry.invalid && entry.uri != mirror {
                entry.uri = mirror.to_string();
            }
        }
    }

    /// Codename of the first enabled, non-flat entry
    pub fn guess_distro(&self) -> Option<String> {
        self.active()
            .find(|e| !e.dist.ends_with('/'))
            .map(|e| e.dist.clone())
    }
}

impl fmt::Display for SourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{}", entry)?;
        }
        Ok(())
    }
}

/// Byte offset of a `#` opening a trailing comment: at the start of the
/// text or after whitespace
fn comment_start(text: &str) -> Option<usize> {
    text.char_indices()
        .find(|&(at, c)| c == '#' && text[..at].chars().next_back().is_none_or(char::is_whitespace))
        .map(|(at, _)| at)
}

/// Split on whitespace, except inside `[...]` (options blocks and
/// `cdrom:[Label with spaces]/` URIs)
fn split_fields(text: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c.is_whitespace() && depth == 0 => {
                if !current.is_empty() {
                    fields.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        fields.push(current);
    }
    fields
}

/// Path of the pre-restore backup for a sources.list
pub fn backup_path(sources_list: &Path) -> PathBuf {
    let mut name = sources_list.as_os_str().to_os_string();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Rewrite a target's repository configuration for `new_distro`
///
/// The main list absorbs any pre-restore backup; `*.list` files in
/// `parts_dir` get the same codename and cdrom treatment. Every list is
/// saved before this returns.
pub fn rewrite_for_distro(sources_list: &Path, parts_dir: &Path, new_distro: &str) -> Result<()> {
    info!("Rewriting {} for {}", sources_list.display(), new_distro);
    let mut main = SourceList::load(sources_list)?;
    main.rewrite_distro(new_distro);
    main.merge_backup(&backup_path(sources_list))?;
    main.cdrom_first();
    main.save()?;

    for part in list_parts(parts_dir)? {
        let mut list = SourceList::load(&part)?;
        list.rewrite_distro(new_distro);
        list.cdrom_first();
        list.save()?;
    }
    Ok(())
}

/// Copy `sources_list` aside before it is replaced, keeping the mode
pub fn backup_existing(sources_list: &Path) -> Result<Option<PathBuf>> {
    if !sources_list.exists() {
        return Ok(None);
    }
    let backup = backup_path(sources_list);
    fs::copy(sources_list, &backup).map_err(|e| Error::io_at(&backup, e))?;
    debug!("Backed up {} to {}", sources_list.display(), backup.display());
    Ok(Some(backup))
}

/// Make a restored list world-readable and owner-writable
pub fn set_list_mode(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o644)).map_err(|e| Error::io_at(path, e))
}

/// `*.list` files of a sources.list.d directory, sorted
pub fn list_parts(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut parts = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::io_at(dir, e))? {
        let path = entry.map_err(|e| Error::io_at(dir, e))?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "list") {
            parts.push(path);
        }
    }
    parts.sort();
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LUCID: &str = "\
# deb cdrom:[Ubuntu 10.04 LTS _Lucid Lynx_ - Release amd64 (20100429)]/ lucid main restricted
deb cdrom:[Ubuntu 10.04 LTS _Lucid Lynx_ - Release amd64 (20100429)]/ lucid main restricted

# See http://help.ubuntu.com/community/UpgradeNotes for how to upgrade to
deb http://gb.archive.ubuntu.com/ubuntu/ lucid main restricted
deb-src http://gb.archive.ubuntu.com/ubuntu/ lucid main restricted
deb http://gb.archive.ubuntu.com/ubuntu/ lucid-updates main restricted
deb http://security.ubuntu.com/ubuntu lucid-security main restricted
# deb http://archive.canonical.com/ubuntu lucid partner
";

    const NATTY: &str = "\
deb http://gb.archive.ubuntu.com/ubuntu/ natty main restricted
deb http://gb.archive.ubuntu.com/ubuntu/ natty-updates main restricted
deb http://archive.canonical.com/ubuntu natty partner
deb http://extras.ubuntu.com/ubuntu natty main
";

    #[test]
    fn test_parse_entry() {
        let entry = SourceEntry::parse(
            "deb [arch=amd64 signed-by=/usr/share/keyrings/x.gpg] https://example.com/apt stable main # vendor",
        );
        assert!(!entry.invalid);
        assert_eq!(entry.options.as_deref(), Some("arch=amd64 signed-by=/usr/share/keyrings/x.gpg"));
        assert_eq!(entry.uri, "https://example.com/apt");
        assert_eq!(entry.dist, "stable");
        assert_eq!(entry.components, vec!["main"]);
        assert_eq!(entry.comment.as_deref(), Some("vendor"));

        let disabled = SourceEntry::parse("# deb-src http://deb.debian.org/debian bookworm main");
        assert!(disabled.disabled);
        assert!(!disabled.invalid);

        assert!(SourceEntry::parse("# just a comment").invalid);
        assert!(SourceEntry::parse("").invalid);
    }

    #[test]
    fn test_hash_inside_uri_is_not_a_comment() {
        let entry = SourceEntry::parse("deb http://mirror.example.com/debian#frag bookworm main #note");
        assert!(!entry.invalid);
        assert_eq!(entry.uri, "http://mirror.example.com/debian#frag");
        assert_eq!(entry.dist, "bookworm");
        assert_eq!(entry.components, vec!["main"]);
        assert_eq!(entry.comment.as_deref(), Some("note"));

        let disabled = SourceEntry::parse("#deb http://example.com/a#b stable main");
        assert!(disabled.disabled);
        assert_eq!(disabled.uri, "http://example.com/a#b");
        assert!(disabled.comment.is_none());
    }

    #[test]
    fn test_pockets_are_kept() {
        let mut list = SourceList::parse(
            "/etc/apt/sources.list",
            "deb http://archive.ubuntu.com/ubuntu jammy main\n\
             deb http://archive.ubuntu.com/ubuntu jammy-updates main\n\
             deb http://security.ubuntu.com/ubuntu jammy-security main\n\
             deb http://archive.ubuntu.com/ubuntu jammy-backports main\n\
             deb http://archive.ubuntu.com/ubuntu jammy-proposed main\n\
             # deb http://archive.ubuntu.com/ubuntu jammy partner\n",
        );
        list.rewrite_distro("noble");
        let dists: Vec<&str> = list.entries.iter().map(|e| e.dist.as_str()).collect();
        assert_eq!(
            dists,
            vec!["noble", "noble-updates", "noble-security", "noble-backports", "noble", "jammy"]
        );
    }

    #[test]
    fn test_merge_without_duplicates() {
        let temp = TempDir::new().unwrap();
        let apt = temp.path().join("etc/apt");
        fs::create_dir_all(&apt).unwrap();
        let sources = apt.join("sources.list");
        fs::write(&sources, LUCID).unwrap();
        fs::write(backup_path(&sources), NATTY).unwrap();

        rewrite_for_distro(&sources, &apt.join("sources.list.d"), "natty").unwrap();
        let content = fs::read_to_string(&sources).unwrap();

        let mut seen = std::collections::HashSet::new();
        for line in content.lines().filter(|l| !l.is_empty() && !l.starts_with('#')) {
            assert!(seen.insert(line), "duplicate line {:?}", line);
        }
        assert!(content.contains("deb http://archive.canonical.com/ubuntu natty partner\n"));
        assert!(content.contains("deb http://extras.ubuntu.com/ubuntu natty main\n"));
        assert!(content.contains("deb http://gb.archive.ubuntu.com/ubuntu/ natty main restricted\n"));
        assert!(!backup_path(&sources).exists());
    }

    #[test]
    fn test_cdrom_moved_first_and_disabled() {
        let mut list = SourceList::parse("/etc/apt/sources.list", LUCID);
        list.rewrite_distro("maverick");
        list.cdrom_first();

        assert!(list.entries[0].is_cdrom() && list.entries[0].disabled);
        assert!(list.entries[1].is_cdrom() && list.entries[1].disabled);
        assert!(list.to_string().starts_with("# deb cdrom:"));
        assert!(list.entries[2..].iter().all(|e| !e.is_cdrom()));
    }

    #[test]
    fn test_untouched_lines_are_preserved() {
        let text = "deb   http://deb.debian.org/debian   bookworm main\n# keep me\n\n";
        let list = SourceList::parse("/etc/apt/sources.list", text);
        assert_eq!(list.to_string(), text);
    }

    #[test]
    fn test_mirror_and_guess_distro() {
        let mut list = SourceList::parse(
            "/etc/apt/sources.list",
            "# header\ndeb http://deb.debian.org/debian bookworm main\ndeb file:/srv/repo ./\n",
        );
        assert_eq!(list.guess_distro().as_deref(), Some("bookworm"));

        list.set_mirror("http://mirror.local/debian");
        assert!(list.active().all(|e| e.uri == "http://mirror.local/debian"));
        assert!(list.entries[0].invalid);
    }
}

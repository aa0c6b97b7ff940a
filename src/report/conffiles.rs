// src/report/conffiles.rs

//! Conffile audit against the dpkg status database

use crate::dpkg;
use crate::error::{Error, Result};
use md5::{Digest, Md5};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Conffiles under `root` that were removed or whose content no longer
/// matches the checksum dpkg recorded; obsolete conffiles are skipped
pub fn modified_conffiles(root: &Path, status_file: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut modified = BTreeSet::new();
    for entry in dpkg::read_status(status_file)? {
        for conffile in entry.conffiles.iter().filter(|c| !c.obsolete) {
            let path = root.join(conffile.path.trim_start_matches('/'));
            if !path.exists() {
                debug!("conffile {} removed", path.display());
                modified.insert(path);
                continue;
            }
            let content = fs::read(&path).map_err(|e| Error::io_at(&path, e))?;
            let digest = format!("{:x}", Md5::digest(&content));
            if digest != conffile.md5sum {
                debug!("conffile {} ({} != {})", path.display(), digest, conffile.md5sum);
                modified.insert(path);
            }
        }
    }
    Ok(modified)
}

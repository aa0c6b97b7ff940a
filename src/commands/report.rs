// src/commands/report.rs

//! `info` and `show-diff` commands

use super::load_config;
use anyhow::Result;
use apt_clone::{AptClone, CloneConfig};
use std::path::Path;

pub fn cmd_info(archive: &Path) -> Result<()> {
    let config = CloneConfig::default();
    let info = AptClone::new(&config).info(archive)?;
    print!("{}", info);
    Ok(())
}

/// Print how `archive` differs from the system at `destination`
pub fn cmd_show_diff(
    config_file: Option<&Path>,
    archive: &Path,
    destination: Option<&Path>,
    conffiles: bool,
) -> Result<()> {
    let config = load_config(config_file, destination)?;
    let diff = AptClone::new(&config).show_diff(archive, &config, conffiles)?;
    print!("{}", diff);
    Ok(())
}

// src/commands/clone.rs

//! `clone` command

use super::{load_config, print_names};
use anyhow::Result;
use apt_clone::{AptClone, SaveOptions};
use std::path::Path;
use tracing::info;

/// Capture `source_root` into a clone file at `destination`
pub fn cmd_clone(
    config_file: Option<&Path>,
    source_root: Option<&Path>,
    destination: &Path,
    options: SaveOptions,
) -> Result<()> {
    let config = load_config(config_file, source_root)?;
    info!("Cloning {} (arch {})", config.root.display(), config.architecture);

    let engine = AptClone::new(&config);
    let report = engine.save_state(&config, destination, &options)?;

    println!("Saved {} packages to {}", report.packages, report.archive_path.display());
    print_names(
        "Packages that can not be downloaded:",
        &report.not_downloadable,
    );
    print_names(
        "Packages whose installed version can not be downloaded:",
        &report.version_mismatch,
    );
    if !report.foreign.is_empty() {
        println!("Packages from other origins:");
        for record in &report.foreign {
            println!("  {} {} ({})", record.name, record.version, record.origin);
        }
    }
    if !report.repacked.is_empty() {
        println!("Repacked {} packages into the clone file", report.repacked.len());
    }
    Ok(())
}

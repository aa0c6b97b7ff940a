// src/commands/restore.rs

//! `restore` and `restore-new-distro` commands
//!
//! A restore that leaves packages behind still succeeds; the missing set is
//! printed so callers can decide for themselves whether that is a failure.

use super::load_config;
use anyhow::Result;
use apt_clone::{AptClone, RestoreOptions, RestoreReport};
use std::path::Path;
use tracing::info;

/// Restore `archive` onto `destination` (or simulate it)
pub fn cmd_restore(
    config_file: Option<&Path>,
    archive: &Path,
    destination: Option<&Path>,
    options: RestoreOptions,
    simulate: bool,
) -> Result<()> {
    let config = load_config(config_file, destination)?;
    let engine = AptClone::new(&config);

    let report = if simulate {
        info!("Simulating restore of {}", archive.display());
        engine.simulate_restore_state(archive, &config, &options)?
    } else {
        info!("Restoring {} onto {}", archive.display(), config.root.display());
        engine.restore_state(archive, &config, &options)?
    };

    print_report(&report, simulate);
    Ok(())
}

/// Restore `archive` with its sources retargeted to `new_distro`
pub fn cmd_restore_new_distro(
    config_file: Option<&Path>,
    archive: &Path,
    new_distro: &str,
    destination: Option<&Path>,
    mut options: RestoreOptions,
    simulate: bool,
) -> Result<()> {
    options.new_distro = Some(new_distro.to_string());
    cmd_restore(config_file, archive, destination, options, simulate)
}

fn print_report(report: &RestoreReport, simulate: bool) {
    if report.excluded > 0 {
        println!("Excluded {} packages", report.excluded);
    }
    if report.missing.is_empty() {
        if simulate {
            println!("All packages can be restored");
        }
        return;
    }

    let header = if simulate {
        "The following packages would not be restored:"
    } else {
        "The following packages could not be restored:"
    };
    println!("{}", header);
    for name in &report.missing {
        println!("  {}", name);
    }
}

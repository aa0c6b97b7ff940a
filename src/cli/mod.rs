// src/cli/mod.rs
//! CLI definitions for apt-clone
//!
//! The command implementations live in the `commands` module.
//!
//! - `clone` - capture the running system (or another root) into an archive
//! - `restore` - replay an archive onto a root, or simulate it
//! - `restore-new-distro` - restore and retarget sources to another release
//! - `info` - summarise an archive
//! - `show-diff` - compare an archive with a system

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "apt-clone")]
#[command(author = "apt-clone Contributors")]
#[command(version)]
#[command(about = "Clone and restore the package state of apt-based systems", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Save the package state of a system into a clone file
    Clone {
        /// Destination file or directory
        destination: PathBuf,

        /// Root of the system to clone [default: /]
        #[arg(long)]
        source_root: Option<PathBuf>,

        /// Repack packages that cannot be downloaded and store them
        #[arg(long)]
        with_dpkg_repack: bool,

        /// Store the full dpkg status database
        #[arg(long)]
        with_dpkg_status: bool,

        /// Replace credentials in repository URIs
        #[arg(long)]
        scrub_sources: bool,

        /// Additional files to store (glob, repeatable)
        #[arg(long = "extra-file", value_name = "GLOB")]
        extra_files: Vec<String>,
    },

    /// Restore a clone file onto a system
    Restore {
        /// Clone file to restore
        archive: PathBuf,

        #[command(flatten)]
        restore: RestoreArgs,
    },

    /// Restore a clone file and upgrade its sources to a newer release
    RestoreNewDistro {
        /// Clone file to restore
        archive: PathBuf,

        /// Codename of the release to restore onto
        new_distro: String,

        #[command(flatten)]
        restore: RestoreArgs,
    },

    /// Show what a clone file contains
    Info {
        /// Clone file to inspect
        archive: PathBuf,
    },

    /// Compare a clone file with a system
    ShowDiff {
        /// Clone file to compare
        archive: PathBuf,

        /// Root of the system to compare against [default: /]
        #[arg(long)]
        destination: Option<PathBuf>,

        /// Also list modified configuration files
        #[arg(long)]
        conffiles: bool,
    },
}

/// Flags shared by `restore` and `restore-new-distro`
#[derive(Args)]
pub struct RestoreArgs {
    /// Root to restore into [default: /]
    #[arg(long)]
    pub destination: Option<PathBuf>,

    /// Skip packages matching this glob (repeatable)
    #[arg(long, value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// Never remove packages already installed on the target
    #[arg(long)]
    pub protect_installed: bool,

    /// Only report what would be missing; change nothing
    #[arg(long)]
    pub simulate: bool,

    /// Replace every repository URI with this mirror
    #[arg(long, value_name = "URI")]
    pub mirror: Option<String>,
}

// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: the clone file
fn archive_arg() -> Arg {
    Arg::new("archive").required(true).help("Clone file")
}

/// Flags shared by restore and restore-new-distro
fn restore_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("destination")
            .long("destination")
            .value_name("DIR")
            .help("Root to restore into [default: /]"),
    )
    .arg(
        Arg::new("exclude")
            .long("exclude")
            .value_name("PATTERN")
            .action(ArgAction::Append)
            .help("Skip packages matching this glob (repeatable)"),
    )
    .arg(
        Arg::new("protect_installed")
            .long("protect-installed")
            .action(ArgAction::SetTrue)
            .help("Never remove packages already installed on the target"),
    )
    .arg(
        Arg::new("simulate")
            .long("simulate")
            .action(ArgAction::SetTrue)
            .help("Only report what would be missing; change nothing"),
    )
    .arg(
        Arg::new("mirror")
            .long("mirror")
            .value_name("URI")
            .help("Replace every repository URI with this mirror"),
    )
}

fn build_cli() -> Command {
    Command::new("apt-clone")
        .version(env!("CARGO_PKG_VERSION"))
        .author("apt-clone Contributors")
        .about("Clone and restore the package state of apt-based systems")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Configuration file (TOML)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Enable debug logging"),
        )
        .subcommand(
            Command::new("clone")
                .about("Save the package state of a system into a clone file")
                .arg(Arg::new("destination").required(true).help("Destination file or directory"))
                .arg(
                    Arg::new("source_root")
                        .long("source-root")
                        .value_name("DIR")
                        .help("Root of the system to clone [default: /]"),
                )
                .arg(
                    Arg::new("with_dpkg_repack")
                        .long("with-dpkg-repack")
                        .action(ArgAction::SetTrue)
                        .help("Repack packages that cannot be downloaded and store them"),
                )
                .arg(
                    Arg::new("with_dpkg_status")
                        .long("with-dpkg-status")
                        .action(ArgAction::SetTrue)
                        .help("Store the full dpkg status database"),
                )
                .arg(
                    Arg::new("scrub_sources")
                        .long("scrub-sources")
                        .action(ArgAction::SetTrue)
                        .help("Replace credentials in repository URIs"),
                )
                .arg(
                    Arg::new("extra_file")
                        .long("extra-file")
                        .value_name("GLOB")
                        .action(ArgAction::Append)
                        .help("Additional files to store (glob, repeatable)"),
                ),
        )
        .subcommand(restore_args(
            Command::new("restore")
                .about("Restore a clone file onto a system")
                .arg(archive_arg()),
        ))
        .subcommand(restore_args(
            Command::new("restore-new-distro")
                .about("Restore a clone file and upgrade its sources to a newer release")
                .arg(archive_arg())
                .arg(
                    Arg::new("new_distro")
                        .required(true)
                        .help("Codename of the release to restore onto"),
                ),
        ))
        .subcommand(
            Command::new("info")
                .about("Show what a clone file contains")
                .arg(archive_arg()),
        )
        .subcommand(
            Command::new("show-diff")
                .about("Compare a clone file with a system")
                .arg(archive_arg())
                .arg(
                    Arg::new("destination")
                        .long("destination")
                        .value_name("DIR")
                        .help("Root of the system to compare against [default: /]"),
                )
                .arg(
                    Arg::new("conffiles")
                        .long("conffiles")
                        .action(ArgAction::SetTrue)
                        .help("Also list modified configuration files"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("apt-clone.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}

// src/main.rs

use anyhow::Result;
use apt_clone::config::DEBUG_RESOLVER_ENV;
use apt_clone::{RestoreOptions, SaveOptions};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::{Cli, Commands, RestoreArgs};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Clone {
            destination,
            source_root,
            with_dpkg_repack,
            with_dpkg_status,
            scrub_sources,
            extra_files,
        } => commands::cmd_clone(
            config,
            source_root.as_deref(),
            &destination,
            SaveOptions {
                with_dpkg_repack,
                with_dpkg_status,
                scrub_sources,
                extra_files,
            },
        ),
        Commands::Restore { archive, restore } => {
            let (destination, simulate, options) = split_restore_args(restore);
            commands::cmd_restore(config, &archive, destination.as_deref(), options, simulate)
        }
        Commands::RestoreNewDistro {
            archive,
            new_distro,
            restore,
        } => {
            let (destination, simulate, options) = split_restore_args(restore);
            commands::cmd_restore_new_distro(
                config,
                &archive,
                &new_distro,
                destination.as_deref(),
                options,
                simulate,
            )
        }
        Commands::Info { archive } => commands::cmd_info(&archive),
        Commands::ShowDiff {
            archive,
            destination,
            conffiles,
        } => commands::cmd_show_diff(config, &archive, destination.as_deref(), conffiles),
    }
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `-v`
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if std::env::var_os(DEBUG_RESOLVER_ENV).is_some()
        && let Ok(directive) = "apt_clone::resolver=debug".parse()
    {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn split_restore_args(args: RestoreArgs) -> (Option<std::path::PathBuf>, bool, RestoreOptions) {
    let options = RestoreOptions {
        exclude: args.exclude,
        protect_installed: args.protect_installed,
        new_distro: None,
        mirror: args.mirror,
    };
    (args.destination, args.simulate, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_restore_new_distro_args() {
        let cli = Cli::try_parse_from([
            "apt-clone",
            "restore-new-distro",
            "state.tar.gz",
            "noble",
            "--destination",
            "/mnt/target",
            "--exclude",
            "linux-image-*",
            "--exclude",
            "nvidia-*",
            "--protect-installed",
        ])
        .unwrap();

        let Commands::RestoreNewDistro {
            archive,
            new_distro,
            restore,
        } = cli.command
        else {
            panic!("wrong subcommand");
        };
        assert_eq!(archive, std::path::PathBuf::from("state.tar.gz"));
        assert_eq!(new_distro, "noble");
        let (destination, simulate, options) = split_restore_args(restore);
        assert_eq!(destination, Some(std::path::PathBuf::from("/mnt/target")));
        assert!(!simulate);
        assert!(options.protect_installed);
        assert_eq!(options.exclude, vec!["linux-image-*", "nvidia-*"]);
    }

    #[test]
    fn test_clone_args_and_global_flags() {
        let cli = Cli::try_parse_from([
            "apt-clone",
            "clone",
            "/backup",
            "-v",
            "--scrub-sources",
            "--extra-file",
            "/etc/hosts",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::Clone {
            scrub_sources,
            extra_files,
            source_root,
            ..
        } = cli.command
        else {
            panic!("wrong subcommand");
        };
        assert!(scrub_sources);
        assert!(source_root.is_none());
        assert_eq!(extra_files, vec!["/etc/hosts"]);
    }
}

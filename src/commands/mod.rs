// src/commands/mod.rs
//! Command handlers for the apt-clone CLI

mod clone;
mod report;
mod restore;

pub use clone::cmd_clone;
pub use report::{cmd_info, cmd_show_diff};
pub use restore::{cmd_restore, cmd_restore_new_distro};

use anyhow::Result;
use apt_clone::config::{DEBUG_RESOLVER_ENV, DEFAULT_CONFIG_PATH};
use apt_clone::CloneConfig;
use std::ffi::OsString;
use std::path::Path;
use tracing::debug;

/// Build the config for one command
///
/// An explicit `--config` file wins over the default location; a root given
/// on the command line wins over the file's root. Environment overrides are
/// applied last.
pub fn load_config(file: Option<&Path>, root: Option<&Path>) -> Result<CloneConfig> {
    let mut config = read_config(file, root)?;
    apply_env(&mut config, std::env::var_os(DEBUG_RESOLVER_ENV));
    Ok(config)
}

fn read_config(file: Option<&Path>, root: Option<&Path>) -> Result<CloneConfig> {
    if let Some(file) = file {
        return Ok(CloneConfig::load_for_root(file, root)?);
    }
    let default = Path::new(DEFAULT_CONFIG_PATH);
    if default.exists() {
        return Ok(CloneConfig::load_for_root(default, root)?);
    }
    let root = root.unwrap_or(Path::new("/"));
    debug!("No configuration file, using defaults for {}", root.display());
    Ok(CloneConfig::for_root(root))
}

fn apply_env(config: &mut CloneConfig, debug_resolver: Option<OsString>) {
    if debug_resolver.is_some() {
        debug!("{} is set, enabling resolver diagnostics", DEBUG_RESOLVER_ENV);
        config.debug_resolver = true;
    }
}

fn print_names(header: &str, names: impl IntoIterator<Item = impl AsRef<str>>) {
    let names: Vec<String> = names.into_iter().map(|n| n.as_ref().to_string()).collect();
    if names.is_empty() {
        return;
    }
    println!("{}", header);
    println!("  {}", names.join(" "));
}

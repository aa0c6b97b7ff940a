// src/system.rs

//! Low-level system operations
//!
//! Everything that shells out to an OS tool during capture or restore goes
//! through [`SystemCommands`], so restore logic can run against
//! [`RecordingCommands`] in tests.

use crate::config::CloneConfig;
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Pseudo filesystems bind-mounted into a chroot target
pub const BIND_MOUNTS: [&str; 2] = ["proc", "sys"];

/// OS tool invocations used by capture and restore
pub trait SystemCommands {
    /// Install local `.deb` files into `root` (chrooted unless `root` is `/`)
    fn install_debs(&self, debs: &[PathBuf], root: &Path) -> Result<()>;

    /// Rebuild the installed `package` as a `.deb` inside `dest`
    fn repack_deb(&self, package: &str, dest: &Path) -> Result<()>;

    /// Create a minimal root filesystem for `distro` at `root`
    fn debootstrap(&self, root: &Path, distro: &str) -> Result<()>;

    /// Import the keys of `from` into the keyring `into`
    fn merge_keys(&self, from: &Path, into: &Path) -> Result<()>;

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()>;

    fn bind_umount(&self, target: &Path) -> Result<()>;
}

/// Runs the real tools
#[derive(Debug, Clone)]
pub struct HostCommands {
    dpkg_repack: PathBuf,
    fakeroot: PathBuf,
}

impl HostCommands {
    pub fn new(config: &CloneConfig) -> Self {
        Self {
            dpkg_repack: config.dpkg_repack.clone(),
            fakeroot: config.fakeroot.clone(),
        }
    }
}

impl SystemCommands for HostCommands {
    fn install_debs(&self, debs: &[PathBuf], root: &Path) -> Result<()> {
        if debs.is_empty() {
            return Ok(());
        }
        let mut cmd = if root == Path::new("/") {
            Command::new("dpkg")
        } else {
            let mut cmd = Command::new("chroot");
            cmd.arg(root).arg("dpkg");
            cmd
        };
        cmd.arg("-i");
        for deb in debs {
            // Inside the chroot, paths are relative to the target root
            match deb.strip_prefix(root) {
                Ok(inner) if root != Path::new("/") => cmd.arg(Path::new("/").join(inner)),
                _ => cmd.arg(deb),
            };
        }
        run(&mut cmd, "dpkg -i")
    }

    fn repack_deb(&self, package: &str, dest: &Path) -> Result<()> {
        if !self.dpkg_repack.exists() {
            return Err(Error::ToolMissing(self.dpkg_repack.display().to_string()));
        }
        let mut cmd = if nix::unistd::geteuid().is_root() {
            Command::new(&self.dpkg_repack)
        } else {
            if !self.fakeroot.exists() {
                return Err(Error::ToolMissing(self.fakeroot.display().to_string()));
            }
            let mut cmd = Command::new(&self.fakeroot);
            cmd.arg("-u").arg(&self.dpkg_repack);
            cmd
        };
        cmd.arg(package).current_dir(dest);
        run(&mut cmd, "dpkg-repack")
    }

    fn debootstrap(&self, root: &Path, distro: &str) -> Result<()> {
        let tool = which::which("debootstrap")
            .map_err(|_| Error::ToolMissing("debootstrap".to_string()))?;
        info!("Bootstrapping {} into {}", distro, root.display());
        let status = Command::new(tool)
            .arg(distro)
            .arg(root)
            .status()
            .map_err(|e| Error::BootstrapFailed(e.to_string()))?;
        if !status.success() {
            return Err(Error::BootstrapFailed(format!(
                "debootstrap {} {} exited with {}",
                distro,
                root.display(),
                status
            )));
        }
        Ok(())
    }

    fn merge_keys(&self, from: &Path, into: &Path) -> Result<()> {
        if let Ok(apt_key) = which::which("apt-key") {
            let mut cmd = Command::new(apt_key);
            cmd.arg("--keyring").arg(into).arg("add").arg(from);
            return run(&mut cmd, "apt-key add");
        }
        let gpg = which::which("gpg").map_err(|_| Error::ToolMissing("gpg".to_string()))?;
        let mut cmd = Command::new(gpg);
        cmd.args(["--batch", "--no-default-keyring", "--keyring"])
            .arg(into)
            .arg("--import")
            .arg(from);
        run(&mut cmd, "gpg --import")
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        let mut cmd = Command::new("mount");
        cmd.arg("--bind").arg(source).arg(target);
        run(&mut cmd, "mount --bind")
    }

    fn bind_umount(&self, target: &Path) -> Result<()> {
        let mut cmd = Command::new("umount");
        cmd.arg(target);
        run(&mut cmd, "umount")
    }
}

fn run(cmd: &mut Command, label: &str) -> Result<()> {
    debug!("Running {:?}", cmd);
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ToolMissing(label.to_string()),
            _ => Error::CommandFailed {
                command: label.to_string(),
                status: e.to_string(),
            },
        })?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        debug!("[{}] {}", label, line);
    }
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            warn!("[{}] {}", label, line);
        }
        return Err(Error::CommandFailed {
            command: label.to_string(),
            status: output.status.to_string(),
        });
    }
    Ok(())
}

/// Unmounts bind mounts when dropped
pub struct BindMountGuard<'a, C: SystemCommands + ?Sized> {
    commands: &'a C,
    mounted: Vec<PathBuf>,
}

impl<'a, C: SystemCommands + ?Sized> BindMountGuard<'a, C> {
    /// Bind-mount `/proc` and `/sys` into `root`; a failed mount is logged
    /// and skipped
    pub fn mount(commands: &'a C, root: &Path) -> Self {
        let mut mounted = Vec::new();
        for dir in BIND_MOUNTS {
            let target = root.join(dir);
            if let Err(e) = fs::create_dir_all(&target) {
                warn!("Cannot create {}: {}", target.display(), e);
                continue;
            }
            match commands.bind_mount(&Path::new("/").join(dir), &target) {
                Ok(()) => mounted.push(target),
                Err(e) => warn!("Bind mount of /{} failed: {}", dir, e),
            }
        }
        Self { commands, mounted }
    }

    pub fn mounted(&self) -> &[PathBuf] {
        &self.mounted
    }
}

impl<C: SystemCommands + ?Sized> Drop for BindMountGuard<'_, C> {
    fn drop(&mut self) {
        for target in self.mounted.drain(..).rev() {
            if let Err(e) = self.commands.bind_umount(&target) {
                warn!("Failed to unmount {}: {}", target.display(), e);
            }
        }
    }
}

/// One recorded system call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    InstallDebs { debs: Vec<PathBuf>, root: PathBuf },
    RepackDeb { package: String, dest: PathBuf },
    Debootstrap { root: PathBuf, distro: String },
    MergeKeys { from: PathBuf, into: PathBuf },
    BindMount { source: PathBuf, target: PathBuf },
    BindUmount { target: PathBuf },
}

/// Records calls instead of running tools
///
/// Repacking writes a placeholder `.deb` and bootstrapping creates the
/// root directory, so callers see the filesystem effects they expect.
/// Tools named with [`without_tool`](Self::without_tool) fail with
/// [`Error::ToolMissing`].
#[derive(Debug, Default)]
pub struct RecordingCommands {
    calls: Mutex<Vec<Call>>,
    missing: BTreeSet<String>,
}

impl RecordingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `tool` (`dpkg-repack`, `debootstrap`, ...) is not installed
    pub fn without_tool(mut self, tool: &str) -> Self {
        self.missing.insert(tool.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: Call) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn require(&self, tool: &str) -> Result<()> {
        if self.missing.contains(tool) {
            return Err(Error::ToolMissing(tool.to_string()));
        }
        Ok(())
    }
}

impl SystemCommands for RecordingCommands {
    fn install_debs(&self, debs: &[PathBuf], root: &Path) -> Result<()> {
        self.require("dpkg")?;
        self.record(Call::InstallDebs {
            debs: debs.to_vec(),
            root: root.to_path_buf(),
        });
        Ok(())
    }

    fn repack_deb(&self, package: &str, dest: &Path) -> Result<()> {
        self.require("dpkg-repack")?;
        self.record(Call::RepackDeb {
            package: package.to_string(),
            dest: dest.to_path_buf(),
        });
        let deb = dest.join(format!("{}_0.0_all.deb", package));
        fs::write(&deb, b"!<arch>\n").map_err(|e| Error::io_at(&deb, e))
    }

    fn debootstrap(&self, root: &Path, distro: &str) -> Result<()> {
        self.require("debootstrap")?;
        self.record(Call::Debootstrap {
            root: root.to_path_buf(),
            distro: distro.to_string(),
        });
        fs::create_dir_all(root).map_err(|e| Error::io_at(root, e))
    }

    fn merge_keys(&self, from: &Path, into: &Path) -> Result<()> {
        self.require("apt-key")?;
        self.record(Call::MergeKeys {
            from: from.to_path_buf(),
            into: into.to_path_buf(),
        });
        Ok(())
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        self.require("mount")?;
        self.record(Call::BindMount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn bind_umount(&self, target: &Path) -> Result<()> {
        self.record(Call::BindUmount {
            target: target.to_path_buf(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bind_mounts_released_in_reverse() {
        let temp = TempDir::new().unwrap();
        let commands = RecordingCommands::new();
        {
            let guard = BindMountGuard::mount(&commands, temp.path());
            assert_eq!(guard.mounted().len(), 2);
        }

        let calls = commands.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(
            calls[2],
            Call::BindUmount {
                target: temp.path().join("sys")
            }
        );
        assert_eq!(
            calls[3],
            Call::BindUmount {
                target: temp.path().join("proc")
            }
        );
    }

    #[test]
    fn test_failed_mount_is_not_unmounted() {
        let temp = TempDir::new().unwrap();
        let commands = RecordingCommands::new().without_tool("mount");
        drop(BindMountGuard::mount(&commands, temp.path()));
        assert!(commands.calls().is_empty());
    }

    #[test]
    fn test_missing_repack_tool() {
        let temp = TempDir::new().unwrap();
        let commands = HostCommands {
            dpkg_repack: temp.path().join("no-dpkg-repack"),
            fakeroot: temp.path().join("no-fakeroot"),
        };
        assert!(matches!(
            commands.repack_deb("foo", temp.path()),
            Err(Error::ToolMissing(_))
        ));
    }
}

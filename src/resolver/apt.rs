// src/resolver/apt.rs

//! Resolver backed by the apt command-line tools
//!
//! Install marks are kept in memory and checked with `apt-get -s install`
//! simulations of the whole pending set; nothing touches the target until
//! [`Resolver::commit`]. Single requests are simulated on their own only
//! when a simulation of the pending set implicates them.
//! Package facts come from the target's dpkg status database,
//! `apt-cache pkgnames` and `apt-cache policy`.

use super::{
    Candidate, InstalledPackage, PackageOrigin, Resolver, ResolverError, ResolverResult,
};
use crate::config::CloneConfig;
use crate::dpkg::{self, StatusEntry};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::process::{Command, Output};
use tracing::{debug, info, warn};

/// Packages per `apt-cache policy` invocation
const POLICY_BATCH: usize = 200;

/// Source line apt uses for the local status database
const STATUS_SOURCE: &str = "/var/lib/dpkg/status";

/// Outcome of one `apt-get -s install` run
#[derive(Debug, Default)]
struct Simulation {
    ok: bool,
    removals: BTreeSet<String>,
    problems: Vec<String>,
}

/// apt-based resolver for one root
pub struct AptResolver {
    root: PathBuf,
    host: bool,
    debug: bool,
    status_file: PathBuf,
    extended_states: PathBuf,
    installed: Vec<StatusEntry>,
    auto: BTreeSet<String>,
    known: BTreeSet<String>,
    pending: Vec<String>,
    auto_changes: BTreeMap<String, bool>,
    protected: BTreeSet<String>,
    /// Simulation of `pending`, cleared whenever marks or protection change
    last: Option<Simulation>,
}

impl AptResolver {
    /// Open the package database of `config.root`
    pub fn open(config: &CloneConfig) -> Result<Self> {
        which::which("apt-get").map_err(|_| Error::ToolMissing("apt-get".to_string()))?;
        which::which("apt-cache").map_err(|_| Error::ToolMissing("apt-cache".to_string()))?;

        let mut resolver = Self {
            root: config.root.clone(),
            host: config.is_host_root(),
            debug: config.debug_resolver,
            status_file: config.status_file.clone(),
            extended_states: config.extended_states.clone(),
            installed: Vec::new(),
            auto: BTreeSet::new(),
            known: BTreeSet::new(),
            pending: Vec::new(),
            auto_changes: BTreeMap::new(),
            protected: BTreeSet::new(),
            last: None,
        };
        resolver.reload()?;
        info!(
            "Opened apt cache for {} ({} installed, {} known)",
            resolver.root.display(),
            resolver.installed.len(),
            resolver.known.len()
        );
        Ok(resolver)
    }

    /// Re-read installed state and the package name index
    fn reload(&mut self) -> Result<()> {
        self.installed = dpkg::read_status(&self.status_file)?
            .into_iter()
            .filter(StatusEntry::is_installed)
            .collect();
        self.auto = dpkg::read_auto_installed(&self.extended_states)?;

        let output = self.run("apt-cache", &["pkgnames".to_string()])?;
        self.known = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        self.known
            .extend(self.installed.iter().map(|e| e.package.clone()));
        self.last = None;
        Ok(())
    }

    /// Options that point apt at the target root
    fn root_options(&self) -> Vec<String> {
        let mut args = Vec::new();
        if !self.host {
            args.push("-o".to_string());
            args.push(format!("Dir={}", self.root.display()));
            args.push("-o".to_string());
            args.push(format!("DPkg::Chroot-Directory={}", self.root.display()));
        }
        if self.debug {
            for option in ["Debug::pkgProblemResolver=1", "Debug::pkgDepCache::AutoInstall=1"] {
                args.push("-o".to_string());
                args.push(option.to_string());
            }
        }
        args
    }

    fn run(&self, program: &str, args: &[String]) -> ResolverResult<Output> {
        let mut cmd = Command::new(program);
        cmd.args(self.root_options())
            .args(args)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .env("LC_ALL", "C");
        debug!("Running {} {}", program, args.join(" "));
        cmd.output()
            .map_err(|e| ResolverError::Backend(format!("failed to run {}: {}", program, e)))
    }

    fn simulate(&self, names: &[String]) -> ResolverResult<Simulation> {
        if names.is_empty() {
            return Ok(Simulation {
                ok: true,
                ..Default::default()
            });
        }
        let mut args = vec!["-s".to_string(), "-q".to_string(), "install".to_string()];
        args.extend(names.iter().cloned());
        let output = self.run("apt-get", &args)?;
        Ok(parse_simulation(&output))
    }

    /// Broken constraints of the pending set, simulated only when the
    /// last result no longer applies
    fn pending_broken(&mut self) -> ResolverResult<usize> {
        let sim = match self.last.take() {
            Some(sim) => sim,
            None => self.simulate(&self.pending)?,
        };
        let count = broken_constraints(&sim, &self.protected);
        self.last = Some(sim);
        Ok(count)
    }

    /// Whether installing `names` keeps every protected package
    fn installs_cleanly(&self, names: &[String]) -> ResolverResult<bool> {
        let sim = self.simulate(names)?;
        Ok(broken_constraints(&sim, &self.protected) == 0)
    }

    fn drop_request(&mut self, name: &str) {
        debug!("Problem resolver drops {}", name);
        self.pending.retain(|n| n != name);
        self.auto_changes.remove(name);
        self.last = None;
    }

    fn is_auto(&self, name: &str) -> bool {
        self.auto_changes
            .get(name)
            .copied()
            .unwrap_or_else(|| self.auto.contains(name))
    }

    /// Map of `apt-cache policy` source lines to their release origin
    fn release_origins(&self) -> HashMap<String, PackageOrigin> {
        match self.run("apt-cache", &["policy".to_string()]) {
            Ok(output) => parse_release_origins(&String::from_utf8_lossy(&output.stdout)),
            Err(e) => {
                warn!("Failed to read release information: {}", e);
                HashMap::new()
            }
        }
    }

    fn policies(&self, names: &[String]) -> HashMap<String, Policy> {
        let mut out = HashMap::new();
        for batch in names.chunks(POLICY_BATCH) {
            let mut args = vec!["policy".to_string()];
            args.extend(batch.iter().cloned());
            match self.run("apt-cache", &args) {
                Ok(output) => out.extend(parse_policy(&String::from_utf8_lossy(&output.stdout))),
                Err(e) => warn!("apt-cache policy failed: {}", e),
            }
        }
        out
    }
}

impl Resolver for AptResolver {
    fn update(&mut self) -> ResolverResult<()> {
        let output = self.run("apt-get", &["update".to_string(), "-q".to_string()])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("apt-get update failed")
                .to_string();
            return Err(ResolverError::FetchFailed(reason));
        }
        self.reload()
            .map_err(|e| ResolverError::Backend(e.to_string()))
    }

    fn contains(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    fn is_installed(&self, name: &str) -> bool {
        self.installed.iter().any(|e| e.package == name)
    }

    fn marked_install(&self, name: &str) -> bool {
        self.pending.iter().any(|n| n == name)
    }

    /// Requests are queued without a simulation of their own; with
    /// `auto_fix` as without, the next [`broken_count`](Resolver::broken_count)
    /// or [`resolve`](Resolver::resolve) checks them together
    fn mark_install(&mut self, name: &str, from_user: bool, auto_fix: bool) -> ResolverResult<()> {
        if !self.contains(name) {
            return Err(ResolverError::UnknownPackage(name.to_string()));
        }
        if self.marked_install(name) {
            return Ok(());
        }

        if auto_fix {
            debug!("Queueing {}; dependencies are checked with the pending set", name);
        }
        self.pending.push(name.to_string());
        if !self.is_installed(name) {
            self.auto_changes.insert(name.to_string(), !from_user);
        }
        self.last = None;
        Ok(())
    }

    fn mark_auto(&mut self, name: &str, auto: bool) {
        if self.contains(name) && self.is_auto(name) != auto {
            self.auto_changes.insert(name.to_string(), auto);
        }
    }

    fn broken_count(&mut self) -> usize {
        match self.pending_broken() {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to simulate pending installs: {}", e);
                1
            }
        }
    }

    fn protect(&mut self, name: &str) {
        self.protected.insert(name.to_string());
        self.last = None;
    }

    fn resolve(&mut self) -> ResolverResult<()> {
        if self.pending_broken()? == 0 {
            return Ok(());
        }
        let suspects = match &self.last {
            Some(sim) => implicated(sim, &self.pending),
            None => self.pending.clone(),
        };
        debug!(
            "Checking {} of {} pending requests on their own",
            suspects.len(),
            self.pending.len()
        );

        let mut retry = Vec::new();
        for name in suspects {
            if self.installs_cleanly(std::slice::from_ref(&name))? {
                retry.push(name);
            } else {
                self.drop_request(&name);
            }
        }

        // Requests that only fail in combination go back one at a time
        if !retry.is_empty() && !self.installs_cleanly(&self.pending)? {
            let mut accepted: Vec<String> = self
                .pending
                .iter()
                .filter(|n| !retry.contains(n))
                .cloned()
                .collect();
            for name in retry {
                let mut trial = accepted.clone();
                trial.push(name.clone());
                if self.installs_cleanly(&trial)? {
                    accepted = trial;
                } else {
                    self.drop_request(&name);
                }
            }
        }
        self.last = None;

        if self.pending_broken()? == 0 {
            Ok(())
        } else {
            Err(ResolverError::Unresolvable {
                name: String::new(),
                reason: "the target system has broken packages".to_string(),
            })
        }
    }

    fn installed_packages(&self) -> Vec<InstalledPackage> {
        let names: Vec<String> = self.installed.iter().map(|e| e.package.clone()).collect();
        let policies = self.policies(&names);
        let releases = self.release_origins();

        self.installed
            .iter()
            .map(|entry| {
                let policy = policies.get(&entry.package);
                let installed_sources = policy
                    .map(|p| p.sources_of(&entry.version))
                    .unwrap_or_default();
                let origins: Vec<PackageOrigin> = installed_sources
                    .iter()
                    .map(|source| origin_of(source, &releases))
                    .collect();
                let installed_downloadable = installed_sources.iter().any(|s| s != STATUS_SOURCE);
                let candidate = policy.and_then(|p| {
                    let version = p.candidate.clone()?;
                    let downloadable = p.sources_of(&version).iter().any(|s| s != STATUS_SOURCE);
                    Some(Candidate {
                        version,
                        downloadable,
                    })
                });

                InstalledPackage {
                    name: entry.package.clone(),
                    version: entry.version.clone(),
                    auto_installed: self.auto.contains(&entry.package),
                    installed_downloadable,
                    candidate,
                    origins: if origins.is_empty() {
                        vec![PackageOrigin::new("now", "")]
                    } else {
                        origins
                    },
                }
            })
            .collect()
    }

    fn commit(&mut self) -> ResolverResult<()> {
        if !self.pending.is_empty() {
            let mut args = vec!["install".to_string(), "-y".to_string(), "-q".to_string()];
            args.extend(self.pending.iter().cloned());
            info!("Installing {} packages", self.pending.len());
            let output = self.run("apt-get", &args)?;
            if !output.status.success() {
                return Err(ResolverError::Backend(format!(
                    "apt-get install failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }

        for (flag, mode) in [(true, "auto"), (false, "manual")] {
            let names: Vec<String> = self
                .auto_changes
                .iter()
                .filter(|(_, auto)| **auto == flag)
                .map(|(name, _)| name.clone())
                .collect();
            if names.is_empty() {
                continue;
            }
            let mut args = vec![mode.to_string()];
            args.extend(names);
            let output = self.run("apt-mark", &args)?;
            if !output.status.success() {
                warn!(
                    "apt-mark {} failed: {}",
                    mode,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }

        self.pending.clear();
        self.auto_changes.clear();
        self.reload()
            .map_err(|e| ResolverError::Backend(e.to_string()))
    }
}

/// Per-package `apt-cache policy` data
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Policy {
    candidate: Option<String>,
    /// Version -> source lines, in priority order
    versions: Vec<(String, Vec<String>)>,
}

impl Policy {
    fn sources_of(&self, version: &str) -> Vec<String> {
        self.versions
            .iter()
            .find(|(v, _)| v == version)
            .map(|(_, sources)| sources.clone())
            .unwrap_or_default()
    }
}

fn parse_simulation(output: &Output) -> Simulation {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut sim = Simulation {
        ok: output.status.success(),
        ..Default::default()
    };
    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("Remv ") {
            if let Some(name) = rest.split_whitespace().next() {
                sim.removals.insert(name.to_string());
            }
        } else if line.contains(" : Depends:")
            || line.contains(" : Conflicts:")
            || line.contains(" : Breaks:")
        {
            sim.problems.push(line.trim().to_string());
        }
    }
    if !sim.ok && sim.problems.is_empty() {
        sim.problems
            .extend(stderr.lines().filter(|l| l.starts_with("E:")).map(str::to_string));
    }
    sim
}

/// Unsatisfied dependencies plus protected packages the simulation removes
fn broken_constraints(sim: &Simulation, protected: &BTreeSet<String>) -> usize {
    let unsatisfied = if sim.ok { 0 } else { sim.problems.len().max(1) };
    unsatisfied + sim.removals.intersection(protected).count()
}

/// Pending requests a failed simulation names as broken
///
/// Removals and bare `E:` errors cannot be traced to a request, so every
/// pending request is a suspect then.
fn implicated(sim: &Simulation, pending: &[String]) -> Vec<String> {
    let named: BTreeSet<&str> = sim
        .problems
        .iter()
        .filter_map(|line| line.split_once(" : ").map(|(name, _)| name.trim()))
        .collect();
    let suspects: Vec<String> = pending
        .iter()
        .filter(|n| named.contains(n.as_str()))
        .cloned()
        .collect();
    if suspects.is_empty() || !sim.removals.is_empty() {
        pending.to_vec()
    } else {
        suspects
    }
}

/// Parse `apt-cache policy <names>` output
fn parse_policy(text: &str) -> HashMap<String, Policy> {
    let mut out = HashMap::new();
    let mut name: Option<String> = None;
    let mut policy = Policy::default();

    for line in text.lines() {
        if !line.starts_with(' ') && line.ends_with(':') {
            if let Some(prev) = name.take() {
                out.insert(prev, std::mem::take(&mut policy));
            }
            let package = line.trim_end_matches(':');
            name = Some(package.split(':').next().unwrap_or(package).to_string());
            continue;
        }

        let trimmed = line.trim();
        if let Some(candidate) = trimmed.strip_prefix("Candidate:") {
            let candidate = candidate.trim();
            policy.candidate = (candidate != "(none)").then(|| candidate.to_string());
        } else if trimmed.starts_with("Installed:") || trimmed.starts_with("Version table:") {
            continue;
        } else if let Some(version) = version_row(line) {
            policy.versions.push((version, Vec::new()));
        } else if let Some((_, source)) = trimmed.split_once(' ')
            && let Some((_, sources)) = policy.versions.last_mut()
        {
            sources.push(source.trim().to_string());
        }
    }
    if let Some(prev) = name {
        out.insert(prev, policy);
    }
    out
}

/// A version row of a version table: ` *** 1.2-3 500` or `     1.2-2 500`
fn version_row(line: &str) -> Option<String> {
    let indent = line.len() - line.trim_start().len();
    if !(5..=8).contains(&indent) && !line.trim_start().starts_with("***") {
        return None;
    }
    let fields: Vec<&str> = line
        .split_whitespace()
        .filter(|f| *f != "***")
        .collect();
    match fields.as_slice() {
        [version, priority] if priority.parse::<i32>().is_ok() && !version.contains('/') => {
            Some(version.to_string())
        }
        _ => None,
    }
}

/// Parse the `Package files:` section of a bare `apt-cache policy`
fn parse_release_origins(text: &str) -> HashMap<String, PackageOrigin> {
    let mut out = HashMap::new();
    let mut source: Option<String> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(release) = trimmed.strip_prefix("release ") {
            let Some(src) = source.as_ref() else { continue };
            let mut archive = String::new();
            let mut origin = String::new();
            for field in release.split(',') {
                match field.split_once('=') {
                    Some(("a", value)) => archive = value.to_string(),
                    Some(("o", value)) => origin = value.to_string(),
                    _ => {}
                }
            }
            out.insert(src.clone(), PackageOrigin::new(archive, origin));
        } else if trimmed.starts_with("origin ") || trimmed == "Package files:" {
            continue;
        } else if let Some((priority, rest)) = trimmed.split_once(' ')
            && priority.parse::<i32>().is_ok()
        {
            source = Some(rest.trim().to_string());
        } else {
            source = None;
        }
    }
    out
}

fn origin_of(source: &str, releases: &HashMap<String, PackageOrigin>) -> PackageOrigin {
    if source == STATUS_SOURCE {
        return PackageOrigin::new("now", "");
    }
    releases
        .get(source)
        .cloned()
        .unwrap_or_else(|| PackageOrigin::new("", ""))
}

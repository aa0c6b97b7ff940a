// src/resolver/memory.rs

//! In-memory resolver over an explicit dependency graph
//!
//! Models the parts of apt's depcache the replay engine relies on: install
//! marks, delete marks, auto flags, protection and a problem resolver that
//! either pulls in missing dependencies or backs out unprotected changes.

use super::{
    Candidate, InstalledPackage, PackageOrigin, Resolver, ResolverError, ResolverResult,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A package in the in-memory universe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPackage {
    pub name: String,
    /// Installed version, if any
    pub installed: Option<String>,
    /// Version the resolver would install
    pub candidate: Option<String>,
    pub candidate_downloadable: bool,
    /// Overrides the derived "installed version is downloadable" answer
    pub installed_downloadable: Option<bool>,
    pub auto_installed: bool,
    pub depends: Vec<String>,
    pub conflicts: Vec<String>,
    pub origins: Vec<PackageOrigin>,
}

impl MemoryPackage {
    /// A known package with no installed version and no candidate
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            installed: None,
            candidate: None,
            candidate_downloadable: false,
            installed_downloadable: None,
            auto_installed: false,
            depends: Vec::new(),
            conflicts: Vec::new(),
            origins: Vec::new(),
        }
    }

    /// Make `version` the downloadable candidate
    pub fn available(mut self, version: impl Into<String>) -> Self {
        self.candidate = Some(version.into());
        self.candidate_downloadable = true;
        self
    }

    /// Candidate that exists but cannot be fetched
    pub fn local_only(mut self, version: impl Into<String>) -> Self {
        self.candidate = Some(version.into());
        self.candidate_downloadable = false;
        self
    }

    pub fn installed(mut self, version: impl Into<String>) -> Self {
        self.installed = Some(version.into());
        self
    }

    pub fn auto(mut self, auto: bool) -> Self {
        self.auto_installed = auto;
        self
    }

    pub fn installed_downloadable(mut self, downloadable: bool) -> Self {
        self.installed_downloadable = Some(downloadable);
        self
    }

    pub fn depends<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn conflicts<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conflicts.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn origin(mut self, archive: impl Into<String>, origin: impl Into<String>) -> Self {
        self.origins.push(PackageOrigin::new(archive, origin));
        self
    }

    fn is_installed_downloadable(&self) -> bool {
        self.installed_downloadable.unwrap_or(
            self.candidate_downloadable
                && self.installed.is_some()
                && self.candidate == self.installed,
        )
    }
}

/// An unsatisfied constraint
#[derive(Debug, Clone, PartialEq, Eq)]
enum Broken {
    Missing { package: String, dependency: String },
    Conflict { package: String, other: String },
}

#[derive(Debug, Clone)]
struct Marks {
    marked: BTreeSet<String>,
    deleted: BTreeSet<String>,
    auto: BTreeMap<String, bool>,
}

/// Resolver over an in-memory package universe
#[derive(Debug, Clone, Default)]
pub struct MemoryResolver {
    packages: BTreeMap<String, MemoryPackage>,
    order: Vec<String>,
    marked: BTreeSet<String>,
    deleted: BTreeSet<String>,
    auto: BTreeMap<String, bool>,
    protected: BTreeSet<String>,
    changes: usize,
    update_failure: Option<String>,
    commits: usize,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_packages(packages: impl IntoIterator<Item = MemoryPackage>) -> Self {
        let mut resolver = Self::new();
        for package in packages {
            resolver.add(package);
        }
        resolver
    }

    /// Add or replace a package; insertion order is the database order
    pub fn add(&mut self, package: MemoryPackage) {
        if !self.packages.contains_key(&package.name) {
            self.order.push(package.name.clone());
        }
        self.packages.insert(package.name.clone(), package);
    }

    /// Make the next [`update`](Resolver::update) fail with `FetchFailed`
    pub fn fail_update(&mut self, reason: impl Into<String>) {
        self.update_failure = Some(reason.into());
    }

    /// Number of state-changing mark operations performed so far
    pub fn changes(&self) -> usize {
        self.changes
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn marked_delete(&self, name: &str) -> bool {
        self.deleted.contains(name)
    }

    pub fn is_protected(&self, name: &str) -> bool {
        self.protected.contains(name)
    }

    /// Effective auto-installed flag, including pending changes
    pub fn is_auto_installed(&self, name: &str) -> Option<bool> {
        let package = self.packages.get(name)?;
        Some(self.auto.get(name).copied().unwrap_or(package.auto_installed))
    }

    pub fn package(&self, name: &str) -> Option<&MemoryPackage> {
        self.packages.get(name)
    }

    /// Names marked for installation, sorted
    pub fn marked_names(&self) -> Vec<String> {
        self.marked.iter().cloned().collect()
    }

    fn will_be_installed(&self, name: &str) -> bool {
        self.marked.contains(name)
            || (!self.deleted.contains(name)
                && self.packages.get(name).is_some_and(|p| p.installed.is_some()))
    }

    fn installable(&self, name: &str) -> bool {
        !self.deleted.contains(name)
            && self.packages.get(name).is_some_and(|p| p.candidate.is_some())
    }

    fn set_marked(&mut self, name: &str) {
        if self.marked.insert(name.to_string()) {
            self.changes += 1;
        }
        if self.deleted.remove(name) {
            self.changes += 1;
        }
    }

    fn set_auto(&mut self, name: &str, auto: bool) {
        if self.is_auto_installed(name) != Some(auto) {
            self.auto.insert(name.to_string(), auto);
            self.changes += 1;
        }
    }

    /// Mark the missing dependencies of `name`, transitively, as auto-installed
    fn install_dependencies(&mut self, name: &str) {
        let mut stack = vec![name.to_string()];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let deps = match self.packages.get(&current) {
                Some(package) => package.depends.clone(),
                None => continue,
            };
            for dep in deps {
                if self.will_be_installed(&dep) || !self.installable(&dep) {
                    continue;
                }
                debug!("Pulling in {} for {}", dep, current);
                self.set_marked(&dep);
                self.set_auto(&dep, true);
                stack.push(dep);
            }
        }
    }

    fn broken(&self) -> Vec<Broken> {
        let mut broken = Vec::new();
        for (name, package) in &self.packages {
            if !self.will_be_installed(name) {
                continue;
            }
            for dep in &package.depends {
                if !self.will_be_installed(dep) {
                    broken.push(Broken::Missing {
                        package: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            for other in &package.conflicts {
                if other != name && self.will_be_installed(other) {
                    broken.push(Broken::Conflict {
                        package: name.clone(),
                        other: other.clone(),
                    });
                }
            }
        }
        broken
    }

    /// Back out `name`: unmark it, or mark it for removal if installed
    fn drop_package(&mut self, name: &str, guard: &BTreeSet<String>) -> bool {
        if guard.contains(name) {
            return false;
        }
        if self.marked.remove(name) {
            debug!("Resolver unmarks {}", name);
            self.changes += 1;
            return true;
        }
        let installed = self.packages.get(name).is_some_and(|p| p.installed.is_some());
        if installed && self.deleted.insert(name.to_string()) {
            debug!("Resolver removes {}", name);
            self.changes += 1;
            return true;
        }
        false
    }

    fn resolve_with(&mut self, guard: &BTreeSet<String>) -> ResolverResult<()> {
        let rounds = self.packages.len() + 1;
        for _ in 0..rounds {
            let broken = self.broken();
            if broken.is_empty() {
                return Ok(());
            }

            let mut progressed = false;
            for item in broken {
                match item {
                    Broken::Missing {
                        package,
                        dependency,
                    } => {
                        if !self.will_be_installed(&package) || self.will_be_installed(&dependency)
                        {
                            continue;
                        }
                        if self.installable(&dependency) {
                            self.set_marked(&dependency);
                            self.set_auto(&dependency, true);
                            self.install_dependencies(&dependency);
                            progressed = true;
                        } else if self.drop_package(&package, guard) {
                            progressed = true;
                        }
                    }
                    Broken::Conflict { package, other } => {
                        if !(self.will_be_installed(&package) && self.will_be_installed(&other)) {
                            continue;
                        }
                        // Kept-installed packages go before requested ones
                        let mut victims = [other, package];
                        victims.sort_by_key(|n| self.marked.contains(n));
                        if victims.iter().any(|v| self.drop_package(v, guard)) {
                            progressed = true;
                        }
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        let remaining = self.broken().len();
        if remaining == 0 {
            Ok(())
        } else {
            Err(ResolverError::Unresolvable {
                name: String::new(),
                reason: format!("{} broken constraints remain", remaining),
            })
        }
    }

    fn snapshot(&self) -> Marks {
        Marks {
            marked: self.marked.clone(),
            deleted: self.deleted.clone(),
            auto: self.auto.clone(),
        }
    }

    fn restore(&mut self, marks: Marks) {
        self.marked = marks.marked;
        self.deleted = marks.deleted;
        self.auto = marks.auto;
    }
}

impl Resolver for MemoryResolver {
    fn update(&mut self) -> ResolverResult<()> {
        match self.update_failure.take() {
            Some(reason) => Err(ResolverError::FetchFailed(reason)),
            None => Ok(()),
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    fn is_installed(&self, name: &str) -> bool {
        self.packages.get(name).is_some_and(|p| p.installed.is_some())
    }

    fn marked_install(&self, name: &str) -> bool {
        self.marked.contains(name)
    }

    fn mark_install(&mut self, name: &str, from_user: bool, auto_fix: bool) -> ResolverResult<()> {
        let package = self
            .packages
            .get(name)
            .ok_or_else(|| ResolverError::UnknownPackage(name.to_string()))?;

        if self.marked.contains(name) {
            return Ok(());
        }
        let up_to_date = package.installed.is_some()
            && (package.candidate.is_none() || package.candidate == package.installed);
        if up_to_date && !self.deleted.contains(name) {
            return Ok(());
        }
        if package.candidate.is_none() {
            return Err(ResolverError::Unresolvable {
                name: name.to_string(),
                reason: "no installation candidate".to_string(),
            });
        }
        let newly_installed = package.installed.is_none();

        let before = self.snapshot();
        self.set_marked(name);
        if newly_installed {
            self.set_auto(name, !from_user);
        }

        if auto_fix {
            self.install_dependencies(name);
            if !self.broken().is_empty() {
                let mut guard = self.protected.clone();
                guard.insert(name.to_string());
                let fixed = self.resolve_with(&guard).is_ok() && self.marked.contains(name);
                if !fixed {
                    self.restore(before);
                    return Err(ResolverError::Unresolvable {
                        name: name.to_string(),
                        reason: "broken packages".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn mark_auto(&mut self, name: &str, auto: bool) {
        if self.packages.contains_key(name) {
            self.set_auto(name, auto);
        }
    }

    fn broken_count(&mut self) -> usize {
        self.broken().len()
    }

    fn protect(&mut self, name: &str) {
        self.protected.insert(name.to_string());
    }

    fn resolve(&mut self) -> ResolverResult<()> {
        let guard = self.protected.clone();
        self.resolve_with(&guard)
    }

    fn installed_packages(&self) -> Vec<InstalledPackage> {
        self.order
            .iter()
            .filter_map(|name| self.packages.get(name))
            .filter_map(|package| {
                let version = package.installed.clone()?;
                Some(InstalledPackage {
                    name: package.name.clone(),
                    version,
                    auto_installed: package.auto_installed,
                    installed_downloadable: package.is_installed_downloadable(),
                    candidate: package.candidate.clone().map(|version| Candidate {
                        version,
                        downloadable: package.candidate_downloadable,
                    }),
                    origins: package.origins.clone(),
                })
            })
            .collect()
    }

    fn commit(&mut self) -> ResolverResult<()> {
        let marked = std::mem::take(&mut self.marked);
        let deleted = std::mem::take(&mut self.deleted);
        let auto = std::mem::take(&mut self.auto);

        for name in &marked {
            if let Some(package) = self.packages.get_mut(name) {
                package.installed = package.candidate.clone();
            }
        }
        for name in &deleted {
            if let Some(package) = self.packages.get_mut(name) {
                package.installed = None;
            }
        }
        for (name, flag) in auto {
            if let Some(package) = self.packages.get_mut(&name) {
                package.auto_installed = flag;
            }
        }
        self.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn universe() -> MemoryResolver {
        MemoryResolver::with_packages([
            MemoryPackage::new("libc6").available("2.36").installed("2.36").auto(true),
            MemoryPackage::new("vim").available("9.0").depends(["vim-runtime", "libc6"]),
            MemoryPackage::new("vim-runtime").available("9.0"),
            MemoryPackage::new("exim4").available("4.96").installed("4.96"),
            MemoryPackage::new("postfix").available("3.7").conflicts(["exim4"]),
            MemoryPackage::new("broken").available("1.0").depends(["does-not-exist"]),
        ])
    }

    #[test]
    fn test_auto_fix_pulls_dependencies() {
        let mut resolver = universe();
        resolver.mark_install("vim", true, true).unwrap();

        assert!(resolver.marked_install("vim"));
        assert!(resolver.marked_install("vim-runtime"));
        assert_eq!(resolver.is_auto_installed("vim-runtime"), Some(true));
        assert_eq!(resolver.is_auto_installed("vim"), Some(false));
        assert_eq!(resolver.broken_count(), 0);
    }

    #[test]
    fn test_auto_fix_removes_unprotected_conflict() {
        let mut resolver = universe();
        resolver.mark_install("postfix", true, true).unwrap();
        assert!(resolver.marked_install("postfix"));
        assert!(resolver.marked_delete("exim4"));
    }

    #[test]
    fn test_protected_conflict_backs_out_request() {
        let mut resolver = universe();
        resolver.protect("exim4");
        resolver.mark_install("postfix", true, false).unwrap();
        assert_eq!(resolver.broken_count(), 1);

        resolver.resolve().unwrap();
        assert!(!resolver.marked_install("postfix"));
        assert!(!resolver.marked_delete("exim4"));
    }

    #[test]
    fn test_unsatisfiable_auto_fix_rolls_back() {
        let mut resolver = universe();
        let err = resolver.mark_install("broken", true, true).unwrap_err();
        assert!(matches!(err, ResolverError::Unresolvable { ref name, .. } if name == "broken"));
        assert!(!resolver.marked_install("broken"));
        assert_eq!(resolver.broken_count(), 0);
    }

    #[test]
    fn test_unknown_package() {
        let mut resolver = universe();
        assert_eq!(
            resolver.mark_install("nope", true, true),
            Err(ResolverError::UnknownPackage("nope".to_string()))
        );
    }

    #[test]
    fn test_commit_applies_marks() {
        let mut resolver = universe();
        resolver.mark_install("vim", true, true).unwrap();
        resolver.commit().unwrap();

        assert!(resolver.is_installed("vim"));
        assert!(!resolver.marked_install("vim"));
        let installed: Vec<String> = resolver
            .installed_packages()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(installed, vec!["libc6", "vim", "exim4", "vim-runtime"]);
    }

    #[test]
    fn test_update_failure_is_reported_once() {
        let mut resolver = universe();
        resolver.fail_update("mirror unreachable");
        assert!(matches!(resolver.update(), Err(ResolverError::FetchFailed(_))));
        assert!(resolver.update().is_ok());
    }
}

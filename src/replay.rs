// src/replay.rs

//! Replay engine
//!
//! Drives a [`Resolver`] towards a recorded [`PackageSelection`]. Problems
//! with individual packages never abort the replay; they end up in the
//! returned missing set instead.

use crate::error::{Error, Result};
use crate::resolver::Resolver;
use crate::selection::{PackageRecord, PackageSelection};
use glob::Pattern;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Glob patterns for package names that replay must skip
#[derive(Debug, Clone, Default)]
pub struct ExcludeSpec {
    patterns: Vec<Pattern>,
}

impl ExcludeSpec {
    /// Compile shell-style globs; an invalid pattern is a configuration error
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut compiled = Vec::new();
        for pat in patterns {
            let pat = pat.as_ref();
            let pattern = Pattern::new(pat).map_err(|e| {
                Error::ConfigError(format!("Invalid exclude pattern '{}': {}", pat, e))
            })?;
            compiled.push(pattern);
        }
        Ok(Self { patterns: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether the full package name matches any pattern
    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }
}

/// Options for one replay
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    pub exclude: ExcludeSpec,
    /// Keep every currently installed package; requested installs that
    /// would remove one are dropped and reported missing
    pub protect_installed: bool,
}

/// Outcome of a replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayResult {
    /// Requested packages that are neither installed nor marked for install
    pub missing: BTreeSet<String>,
    /// Records skipped by the exclude patterns
    pub excluded: usize,
}

impl ReplayResult {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Mark every package of `selection` for installation on `resolver`
///
/// The resolver is left with pending marks; committing them is the
/// caller's job.
pub fn replay<R: Resolver + ?Sized>(
    selection: &PackageSelection,
    resolver: &mut R,
    options: &ReplayOptions,
) -> ReplayResult {
    let records: Vec<&PackageRecord> = selection
        .iter()
        .filter(|r| !options.exclude.matches(&r.name))
        .collect();
    let excluded = selection.len() - records.len();
    if excluded > 0 {
        info!("Skipping {} excluded packages", excluded);
    }

    if options.protect_installed {
        let installed = resolver.installed_packages();
        debug!("Protecting {} installed packages", installed.len());
        for package in installed {
            resolver.protect(&package.name);
        }
    }

    let mut missing = BTreeSet::new();
    for record in &records {
        if !resolver.contains(&record.name) {
            debug!("{} is not known to the resolver", record.name);
            continue;
        }
        if let Err(reason) = mark_record(resolver, record, options.protect_installed) {
            warn!("Cannot mark {} for install: {}", record.name, reason);
            missing.insert(record.name.clone());
        }
        resolver.mark_auto(&record.name, record.auto_installed);
    }

    if resolver.broken_count() > 0 {
        debug!("Running final problem resolver pass");
        if let Err(e) = resolver.resolve() {
            warn!("Problem resolver could not fix all breakage: {}", e);
        }
    }

    for record in &records {
        let present = resolver.contains(&record.name)
            && (resolver.is_installed(&record.name) || resolver.marked_install(&record.name));
        if !present {
            missing.insert(record.name.clone());
        }
    }

    info!(
        "Replay finished: {} requested, {} missing",
        records.len(),
        missing.len()
    );
    ReplayResult { missing, excluded }
}

fn mark_record<R: Resolver + ?Sized>(
    resolver: &mut R,
    record: &PackageRecord,
    protect_installed: bool,
) -> std::result::Result<(), String> {
    let from_user = !record.auto_installed;
    if !protect_installed {
        return resolver
            .mark_install(&record.name, from_user, true)
            .map_err(|e| e.to_string());
    }

    resolver
        .mark_install(&record.name, from_user, false)
        .map_err(|e| e.to_string())?;
    // An up-to-date installed package carries no mark to lose
    let requested = resolver.marked_install(&record.name);
    if resolver.broken_count() > 0 {
        resolver.resolve().map_err(|e| e.to_string())?;
        if requested && !resolver.marked_install(&record.name) {
            return Err("dropped by the problem resolver".to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{InstalledPackage, MemoryPackage, MemoryResolver, ResolverResult};

    fn selection(records: &[(&str, bool)]) -> PackageSelection {
        PackageSelection::new(
            records
                .iter()
                .map(|(name, auto)| PackageRecord::new(*name, "1.0", *auto))
                .collect(),
        )
    }

    #[test]
    fn test_install_with_dependencies() {
        let mut resolver = MemoryResolver::with_packages([
            MemoryPackage::new("foo").available("1.0").depends(["libfoo"]),
            MemoryPackage::new("libfoo").available("1.0"),
        ]);
        let result = replay(
            &selection(&[("foo", false), ("libfoo", true)]),
            &mut resolver,
            &ReplayOptions::default(),
        );

        assert!(result.is_complete());
        assert!(resolver.marked_install("foo"));
        assert!(resolver.marked_install("libfoo"));
        assert_eq!(resolver.is_auto_installed("foo"), Some(false));
        assert_eq!(resolver.is_auto_installed("libfoo"), Some(true));
    }

    #[test]
    fn test_unknown_package_is_missing() {
        let mut resolver =
            MemoryResolver::with_packages([MemoryPackage::new("foo").available("1.0")]);
        let result = replay(
            &selection(&[("foo", false), ("bar", false)]),
            &mut resolver,
            &ReplayOptions::default(),
        );

        assert_eq!(result.missing, BTreeSet::from(["bar".to_string()]));
        assert!(resolver.marked_install("foo"));
    }

    #[test]
    fn test_protected_conflict_reports_missing() {
        let mut resolver = MemoryResolver::with_packages([
            MemoryPackage::new("exim4").available("4.96").installed("4.96"),
            MemoryPackage::new("postfix").available("3.7").conflicts(["exim4"]),
        ]);
        let options = ReplayOptions {
            protect_installed: true,
            ..Default::default()
        };
        let result = replay(&selection(&[("postfix", false)]), &mut resolver, &options);

        assert_eq!(result.missing, BTreeSet::from(["postfix".to_string()]));
        assert!(resolver.is_protected("exim4"));
        assert!(!resolver.marked_delete("exim4"));
        assert!(resolver.is_installed("exim4"));
    }

    /// Wraps a [`MemoryResolver`]; its problem resolver silently drops one
    /// pending upgrade and it records every install request
    struct DroppingResolver {
        inner: MemoryResolver,
        drop_on_resolve: Option<String>,
        dropped: BTreeSet<String>,
        mark_calls: Vec<String>,
    }

    impl DroppingResolver {
        fn new(inner: MemoryResolver, drop_on_resolve: Option<&str>) -> Self {
            Self {
                inner,
                drop_on_resolve: drop_on_resolve.map(str::to_string),
                dropped: BTreeSet::new(),
                mark_calls: Vec::new(),
            }
        }
    }

    impl Resolver for DroppingResolver {
        fn update(&mut self) -> ResolverResult<()> {
            self.inner.update()
        }
        fn contains(&self, name: &str) -> bool {
            self.inner.contains(name)
        }
        fn is_installed(&self, name: &str) -> bool {
            self.inner.is_installed(name)
        }
        fn marked_install(&self, name: &str) -> bool {
            self.inner.marked_install(name) && !self.dropped.contains(name)
        }
        fn mark_install(&mut self, name: &str, from_user: bool, auto_fix: bool) -> ResolverResult<()> {
            self.mark_calls.push(name.to_string());
            self.inner.mark_install(name, from_user, auto_fix)
        }
        fn mark_auto(&mut self, name: &str, auto: bool) {
            self.inner.mark_auto(name, auto)
        }
        fn broken_count(&mut self) -> usize {
            let pending = self
                .drop_on_resolve
                .as_deref()
                .is_some_and(|name| self.inner.marked_install(name));
            self.inner.broken_count() + usize::from(pending)
        }
        fn protect(&mut self, name: &str) {
            self.inner.protect(name)
        }
        fn resolve(&mut self) -> ResolverResult<()> {
            if let Some(name) = self.drop_on_resolve.take() {
                self.dropped.insert(name);
            }
            self.inner.resolve()
        }
        fn installed_packages(&self) -> Vec<InstalledPackage> {
            self.inner.installed_packages()
        }
        fn commit(&mut self) -> ResolverResult<()> {
            self.inner.commit()
        }
    }

    #[test]
    fn test_protected_dropped_upgrade_is_missing() {
        let inner = MemoryResolver::with_packages([
            MemoryPackage::new("app").available("2.0").installed("1.0"),
            MemoryPackage::new("vim").available("9.0"),
        ]);
        let mut resolver = DroppingResolver::new(inner, Some("app"));
        let options = ReplayOptions {
            protect_installed: true,
            ..Default::default()
        };
        let result = replay(
            &selection(&[("app", false), ("vim", false)]),
            &mut resolver,
            &options,
        );

        assert_eq!(result.missing, BTreeSet::from(["app".to_string()]));
        assert!(!resolver.marked_install("app"));
        assert!(resolver.marked_install("vim"));
    }

    #[test]
    fn test_unknown_package_is_never_marked() {
        let inner = MemoryResolver::with_packages([MemoryPackage::new("foo").available("1.0")]);
        let mut resolver = DroppingResolver::new(inner, None);
        let result = replay(
            &selection(&[("ghost", false), ("foo", true)]),
            &mut resolver,
            &ReplayOptions::default(),
        );

        assert_eq!(result.missing, BTreeSet::from(["ghost".to_string()]));
        assert_eq!(resolver.mark_calls, vec!["foo".to_string()]);
        assert_eq!(resolver.inner.is_auto_installed("foo"), Some(true));
    }

    #[test]
    fn test_protected_conflict_leaves_other_records_alone() {
        let mut resolver = MemoryResolver::with_packages([
            MemoryPackage::new("exim4").available("4.96").installed("4.96"),
            MemoryPackage::new("postfix").available("3.7").conflicts(["exim4"]),
            MemoryPackage::new("vim").available("9.0").depends(["libgpm2"]),
            MemoryPackage::new("libgpm2").available("1.20"),
        ]);
        let options = ReplayOptions {
            protect_installed: true,
            ..Default::default()
        };
        let result = replay(
            &selection(&[("postfix", false), ("vim", false)]),
            &mut resolver,
            &options,
        );

        assert_eq!(result.missing, BTreeSet::from(["postfix".to_string()]));
        assert!(!resolver.marked_install("postfix"));
        assert!(resolver.marked_install("vim"));
        assert!(resolver.marked_install("libgpm2"));
        assert!(!resolver.marked_delete("exim4"));
    }

    #[test]
    fn test_excluded_records_are_untouched() {
        let mut resolver = MemoryResolver::with_packages([
            MemoryPackage::new("linux-image-6.1.0-13-amd64").available("6.1"),
            MemoryPackage::new("vim").available("9.0"),
        ]);
        let options = ReplayOptions {
            exclude: ExcludeSpec::new(&["linux-image-*", "nvidia-[0-9]*"]).unwrap(),
            ..Default::default()
        };
        let result = replay(
            &selection(&[("linux-image-6.1.0-13-amd64", false), ("vim", false), ("nvidia-535", false)]),
            &mut resolver,
            &options,
        );

        assert!(result.is_complete());
        assert_eq!(result.excluded, 2);
        assert!(!resolver.marked_install("linux-image-6.1.0-13-amd64"));
        assert_eq!(resolver.is_auto_installed("linux-image-6.1.0-13-amd64"), Some(false));
        assert!(resolver.marked_install("vim"));
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut resolver = MemoryResolver::with_packages([
            MemoryPackage::new("foo").available("1.0").depends(["libfoo"]),
            MemoryPackage::new("libfoo").available("1.0"),
            MemoryPackage::new("bar").available("2.0").installed("2.0"),
        ]);
        let sel = selection(&[("foo", false), ("bar", true), ("ghost", false)]);

        let first = replay(&sel, &mut resolver, &ReplayOptions::default());
        let changes = resolver.changes();
        let second = replay(&sel, &mut resolver, &ReplayOptions::default());

        assert_eq!(first, second);
        assert_eq!(resolver.changes(), changes);
        assert_eq!(resolver.is_auto_installed("bar"), Some(true));
    }

    #[test]
    fn test_invalid_exclude_pattern() {
        assert!(matches!(
            ExcludeSpec::new(&["[unclosed"]),
            Err(Error::ConfigError(_))
        ));
    }
}

// src/resolver/mod.rs

//! Package resolver capability
//!
//! The replay engine never solves dependencies itself. It drives a
//! [`Resolver`]: a package database plus problem resolver with explicit
//! mark/protect/resolve primitives. Implementations are not assumed to be
//! thread-safe or reentrant; every method takes the resolver by reference
//! from a single caller.
//!
//! - [`MemoryResolver`]: self-contained dependency graph, used by tests and
//!   for offline dry runs
//! - [`AptResolver`]: drives apt-get / apt-cache / apt-mark against a root

mod apt;
mod memory;

pub use apt::AptResolver;
pub use memory::{MemoryPackage, MemoryResolver};

use thiserror::Error;

/// Errors reported by a resolver backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    /// The package is not in the resolver's index
    #[error("unknown package: {0}")]
    UnknownPackage(String),

    /// Marking or resolving left unsatisfiable constraints
    #[error("cannot install {name}: {reason}")]
    Unresolvable { name: String, reason: String },

    /// Refreshing package indexes failed; callers treat this as a warning
    #[error("failed to fetch package indexes: {0}")]
    FetchFailed(String),

    /// The backend itself could not run
    #[error("resolver backend error: {0}")]
    Backend(String),
}

/// Result type for resolver operations
pub type ResolverResult<T> = std::result::Result<T, ResolverError>;

/// Where an installed version came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageOrigin {
    /// Archive/suite name; `now` for the local status database
    pub archive: String,
    /// Release origin (vendor) name; empty when unknown
    pub origin: String,
}

impl PackageOrigin {
    pub fn new(archive: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            archive: archive.into(),
            origin: origin.into(),
        }
    }

    /// The pseudo-origin of a package known only from the status database
    pub fn is_local_status(&self) -> bool {
        self.archive == "now" && self.origin.is_empty()
    }
}

/// The version apt would install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub version: String,
    pub downloadable: bool,
}

/// An installed package as seen by a resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    pub auto_installed: bool,
    /// The installed version can still be fetched from some repository
    pub installed_downloadable: bool,
    pub candidate: Option<Candidate>,
    /// Origins of the installed version, in resolver priority order
    pub origins: Vec<PackageOrigin>,
}

/// Package database and problem resolver for one root
pub trait Resolver {
    /// Refresh package indexes
    ///
    /// [`ResolverError::FetchFailed`] is recoverable: callers log it and
    /// continue with whatever indexes are present.
    fn update(&mut self) -> ResolverResult<()>;

    /// Whether the package is known at all
    fn contains(&self, name: &str) -> bool;

    fn is_installed(&self, name: &str) -> bool;

    /// Whether the package is marked for installation or upgrade
    fn marked_install(&self, name: &str) -> bool;

    /// Request installation of `name`
    ///
    /// With `auto_fix`, the backend repairs the dependency graph and fails
    /// if it cannot; without it, breakage is left for
    /// [`resolve`](Self::resolve). A backend may defer the repair to the
    /// next [`broken_count`](Self::broken_count) or `resolve`, which then
    /// drops the request instead.
    fn mark_install(&mut self, name: &str, from_user: bool, auto_fix: bool) -> ResolverResult<()>;

    /// Set the auto-installed flag, independent of the install mark
    fn mark_auto(&mut self, name: &str, auto: bool);

    /// Number of unsatisfied dependency constraints
    fn broken_count(&mut self) -> usize;

    /// Keep `name` out of any removal the problem resolver considers
    fn protect(&mut self, name: &str);

    /// Run the problem resolver once
    fn resolve(&mut self) -> ResolverResult<()>;

    /// Installed packages in database order
    fn installed_packages(&self) -> Vec<InstalledPackage>;

    /// Apply all marks to the root
    fn commit(&mut self) -> ResolverResult<()>;
}

impl<R: Resolver + ?Sized> Resolver for Box<R> {
    fn update(&mut self) -> ResolverResult<()> {
        (**self).update()
    }
    fn contains(&self, name: &str) -> bool {
        (**self).contains(name)
    }
    fn is_installed(&self, name: &str) -> bool {
        (**self).is_installed(name)
    }
    fn marked_install(&self, name: &str) -> bool {
        (**self).marked_install(name)
    }
    fn mark_install(&mut self, name: &str, from_user: bool, auto_fix: bool) -> ResolverResult<()> {
        (**self).mark_install(name, from_user, auto_fix)
    }
    fn mark_auto(&mut self, name: &str, auto: bool) {
        (**self).mark_auto(name, auto)
    }
    fn broken_count(&mut self) -> usize {
        (**self).broken_count()
    }
    fn protect(&mut self, name: &str) {
        (**self).protect(name)
    }
    fn resolve(&mut self) -> ResolverResult<()> {
        (**self).resolve()
    }
    fn installed_packages(&self) -> Vec<InstalledPackage> {
        (**self).installed_packages()
    }
    fn commit(&mut self) -> ResolverResult<()> {
        (**self).commit()
    }
}

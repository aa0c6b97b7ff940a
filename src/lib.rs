// src/lib.rs

//! apt-clone
//!
//! Capture the package selection and repository configuration of a
//! Debian/apt system into a single archive, and replay it onto another
//! root (optionally retargeted to a newer release).
//!
//! # Architecture
//!
//! - Archive container: gzip-compressed tar with fixed logical member names
//! - Package selection: `name version auto` records, written in install order
//! - Replay: records are marked through a [`Resolver`]; what cannot be
//!   installed ends up in a missing set instead of aborting the restore
//! - Source-list rewriter: codename swap plus merge of the pre-restore list
//! - Every operation takes an explicit [`CloneConfig`]

pub mod archive;
pub mod clone;
pub mod config;
pub mod dpkg;
mod error;
pub mod host;
pub mod replay;
pub mod report;
pub mod resolver;
pub mod scrub;
pub mod selection;
pub mod sources;
pub mod system;

pub use archive::{ArchiveWriter, CloneArchive};
pub use clone::{AptClone, CaptureReport, RestoreOptions, RestoreReport, SaveOptions};
pub use config::CloneConfig;
pub use error::{Error, Result};
pub use replay::{ExcludeSpec, ReplayOptions, ReplayResult, replay};
pub use resolver::{MemoryPackage, MemoryResolver, Resolver, ResolverError};
pub use selection::{ForeignRecord, PackageRecord, PackageSelection};
pub use sources::{SourceEntry, SourceList};

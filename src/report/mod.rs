// src/report/mod.rs

//! Read-only reports over clone archives and target systems
//!
//! - [`info`]: summary of what an archive holds
//! - [`diff`]: differences between an archive and a live system
//! - [`conffiles`]: configuration files changed since installation

pub mod conffiles;
pub mod diff;
pub mod info;

pub use conffiles::modified_conffiles;
pub use diff::{CloneDiff, InfoDifference, VersionDifference, show_diff};
pub use info::{CloneInfo, clone_info};

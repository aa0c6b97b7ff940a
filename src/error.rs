// src/error.rs

//! Error types shared across the apt-clone library

use thiserror::Error;

/// Result type for apt-clone operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort a single capture, restore or report operation
///
/// Failures that concern one package never show up here; the replay
/// engine folds them into the missing set instead.
#[derive(Error, Debug)]
pub enum Error {
    /// The clone state file does not exist
    #[error("clone archive not found: {0}")]
    ArchiveNotFound(String),

    /// The clone state file is not a readable gzip-compressed tar container
    #[error("clone archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    /// A required archive member is absent
    #[error("archive member not found: {0}")]
    MemberNotFound(String),

    /// A package list line that does not split into the expected fields
    #[error("malformed record in {member} line {line}: {content:?}")]
    MalformedRecord {
        member: String,
        line: usize,
        content: String,
    },

    /// sources.list could not be parsed or persisted
    #[error("sources.list error: {0}")]
    SourcesError(String),

    /// A required external tool is not installed
    #[error("required tool not found: {0}")]
    ToolMissing(String),

    /// An external tool ran but reported failure
    #[error("command '{command}' failed: {status}")]
    CommandFailed { command: String, status: String },

    /// The target root could not be bootstrapped
    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The package resolver could not be opened or committed
    #[error("resolver error: {0}")]
    ResolverError(#[from] crate::resolver::ResolverError),

    /// Filesystem error with context
    #[error("I/O error: {0}")]
    IoError(String),

    /// Plain I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an I/O error that names the path involved
    pub fn io_at(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        Self::IoError(format!("{}: {}", path.as_ref().display(), err))
    }
}

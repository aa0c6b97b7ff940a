// src/host.rs

//! Host identity recorded in the `uname` archive member

use crate::error::{Error, Result};
use std::fmt::Write as _;

/// Placeholder for facts an archive does not carry
pub const UNKNOWN: &str = "unknown";

/// Identity of the machine a clone was taken on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub hostname: String,
    /// Kernel release
    pub kernel: String,
    /// Machine hardware name as reported by uname
    pub uname_arch: String,
    /// Debian architecture
    pub arch: String,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            hostname: UNKNOWN.to_string(),
            kernel: UNKNOWN.to_string(),
            uname_arch: UNKNOWN.to_string(),
            arch: UNKNOWN.to_string(),
        }
    }
}

impl HostInfo {
    /// Identity of the running system
    pub fn current(arch: &str) -> Result<Self> {
        let uts = nix::sys::utsname::uname()
            .map_err(|e| Error::IoError(format!("uname failed: {}", e)))?;
        Ok(Self {
            hostname: uts.nodename().to_string_lossy().into_owned(),
            kernel: uts.release().to_string_lossy().into_owned(),
            uname_arch: uts.machine().to_string_lossy().into_owned(),
            arch: arch.to_string(),
        })
    }

    /// `key: value` lines, one per fact
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        for (key, value) in self.fields() {
            let _ = writeln!(out, "{}: {}", key, value);
        }
        out.into_bytes()
    }

    /// Parse `key: value` lines; unknown keys are ignored and missing ones
    /// stay [`UNKNOWN`]
    pub fn decode(data: &[u8]) -> Self {
        let mut info = Self::default();
        for line in String::from_utf8_lossy(data).lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim() {
                "hostname" => info.hostname = value,
                "kernel" => info.kernel = value,
                "uname_arch" => info.uname_arch = value,
                "arch" => info.arch = value,
                _ => {}
            }
        }
        info
    }

    /// Facts in their on-disk order
    pub fn fields(&self) -> [(&'static str, &str); 4] {
        [
            ("hostname", &self.hostname),
            ("kernel", &self.kernel),
            ("uname_arch", &self.uname_arch),
            ("arch", &self.arch),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_partial() {
        let info = HostInfo::decode(b"hostname: build-01\narch: arm64\nextra: ignored\n");
        assert_eq!(info.hostname, "build-01");
        assert_eq!(info.arch, "arm64");
        assert_eq!(info.kernel, UNKNOWN);
    }

    #[test]
    fn test_current_host() {
        let info = HostInfo::current("amd64").unwrap();
        assert!(!info.hostname.is_empty());
        assert_eq!(HostInfo::decode(&info.encode()), info);
    }
}

//! Target platform identification.
//!
//! A [`Platform`] names one image variant (OS, architecture, optional
//! variant). Requested platforms are immutable inputs to a build; the
//! host platform can be detected as a default target.

use std::fmt;

use crate::error::{Error, Result};

/// One target platform for an image variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    /// Operating system.
    pub os: Os,
    /// CPU architecture.
    pub arch: Arch,
    /// Architecture variant (e.g., `v7` for 32-bit ARM).
    pub variant: Option<String>,
}

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
    Arm,
    Ppc64le,
    S390x,
}

impl Platform {
    /// Creates a platform from OS and architecture with no variant.
    pub fn new(os: Os, arch: Arch) -> Self {
        Self {
            os,
            arch,
            variant: None,
        }
    }

    /// Sets the architecture variant.
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Detects the host platform.
    ///
    /// Used as the default target when the caller does not request an
    /// explicit platform list.
    pub fn host() -> Self {
        let os = {
            #[cfg(target_os = "macos")]
            {
                Os::Darwin
            }
            #[cfg(target_os = "windows")]
            {
                Os::Windows
            }
            #[cfg(not(any(target_os = "macos", target_os = "windows")))]
            {
                Os::Linux
            }
        };

        let arch = {
            #[cfg(target_arch = "aarch64")]
            {
                Arch::Arm64
            }
            #[cfg(target_arch = "arm")]
            {
                Arch::Arm
            }
            #[cfg(not(any(target_arch = "aarch64", target_arch = "arm")))]
            {
                Arch::Amd64
            }
        };

        Self::new(os, arch)
    }

    /// Parses a platform string such as `linux/amd64` or `linux/arm/v7`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let os = parts
            .next()
            .and_then(Os::from_str)
            .ok_or_else(|| Error::InvalidPlatform(s.to_string()))?;
        let arch = parts
            .next()
            .and_then(Arch::from_str)
            .ok_or_else(|| Error::InvalidPlatform(s.to_string()))?;
        let variant = parts.next().map(str::to_string);

        if parts.next().is_some() {
            return Err(Error::InvalidPlatform(s.to_string()));
        }

        Ok(Self { os, arch, variant })
    }
}

impl Os {
    /// Returns the OCI string for this OS (`linux`, `darwin`, `windows`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
            Os::Windows => "windows",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "linux" => Some(Os::Linux),
            "darwin" => Some(Os::Darwin),
            "windows" => Some(Os::Windows),
            _ => None,
        }
    }
}

impl Arch {
    /// Returns the OCI string for this architecture.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::Ppc64le => "ppc64le",
            Arch::S390x => "s390x",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "amd64" => Some(Arch::Amd64),
            "arm64" => Some(Arch::Arm64),
            "arm" => Some(Arch::Arm),
            "ppc64le" => Some(Arch::Ppc64le),
            "s390x" => Some(Arch::S390x),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os.as_str(), self.arch.as_str())?;
        if let Some(v) = &self.variant {
            write!(f, "/{}", v)?;
        }
        Ok(())
    }
}

//! Protocol version negotiation.
//!
//! Both endpoints declare the version they speak and the oldest version they
//! still accept. The values are exchanged during connection setup by the
//! transport layer; this module only decides whether they overlap.

use serde::{Deserialize, Serialize};

/// Version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 0;

/// Oldest peer version this implementation accepts.
pub const MIN_SUPPORTED_PROTOCOL_VERSION: u32 = 0;

/// Version pair exchanged for one connection. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionVersion {
    pub local_version: u32,
    pub local_min_supported: u32,
    pub remote_version: u32,
    pub remote_min_supported: u32,
}

/// Outcome of [`ConnectionVersion::compute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    Incompatible(String),
}

impl Compatibility {
    #[inline]
    pub fn is_compatible(&self) -> bool {
        matches!(self, Compatibility::Compatible)
    }
}

impl ConnectionVersion {
    pub fn new(
        local_version: u32,
        local_min_supported: u32,
        remote_version: u32,
        remote_min_supported: u32,
    ) -> Self {
        Self {
            local_version,
            local_min_supported,
            remote_version,
            remote_min_supported,
        }
    }

    /// Compatible iff each side's version meets the other side's minimum.
    ///
    /// # Example
    ///
    /// ```
    /// use wiredrop::version::ConnectionVersion;
    ///
    /// assert!(ConnectionVersion::new(0, 0, 0, 0).compute().is_compatible());
    /// assert!(!ConnectionVersion::new(1, 1, 0, 0).compute().is_compatible());
    /// ```
    pub fn compute(&self) -> Compatibility {
        if self.remote_version < self.local_min_supported {
            return Compatibility::Incompatible(format!(
                "remote version {} is older than local minimum {}",
                self.remote_version, self.local_min_supported
            ));
        }
        if self.local_version < self.remote_min_supported {
            return Compatibility::Incompatible(format!(
                "local version {} is older than remote minimum {}",
                self.local_version, self.remote_min_supported
            ));
        }
        Compatibility::Compatible
    }
}

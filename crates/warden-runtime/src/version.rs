//! Numeric artifact versions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A `major.minor.patch` release version.
///
/// Parsing accepts an optional leading `v`, so `v0.28.0` and `0.28.0` are
/// the same version; display is always the bare triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactVersion {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
}

/// Error raised for strings that are not a numeric version triple.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not a major.minor.patch version")]
pub struct VersionParseError(String);

impl ArtifactVersion {
    /// Creates a version from its components.
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses a bare triple without the optional `v` prefix.
    pub(crate) fn parse_bare(input: &str) -> Option<Self> {
        let mut parts = input.split('.');
        let major = numeric(parts.next())?;
        let minor = numeric(parts.next())?;
        let patch = numeric(parts.next())?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, patch))
    }
}

fn numeric(part: Option<&str>) -> Option<u64> {
    let part = part?;
    if part.is_empty() || !part.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

impl FromStr for ArtifactVersion {
    type Err = VersionParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let bare = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        Self::parse_bare(bare).ok_or_else(|| VersionParseError(input.to_owned()))
    }
}

impl fmt::Display for ArtifactVersion {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl TryFrom<String> for ArtifactVersion {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ArtifactVersion> for String {
    fn from(version: ArtifactVersion) -> Self {
        version.to_string()
    }
}

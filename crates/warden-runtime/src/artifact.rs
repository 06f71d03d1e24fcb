//! Artifact naming and identity.

use std::path::PathBuf;

use crate::version::ArtifactVersion;

/// Where releases of an artifact are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseSource {
    /// Releases of a GitHub repository.
    GitHub {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
    },
}

impl ReleaseSource {
    /// Releases of `owner/repo` on GitHub.
    #[must_use]
    pub fn github(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self::GitHub {
            owner: owner.into(),
            repo: repo.into(),
        }
    }
}

/// File-name pattern `<prefix><X.Y.Z><suffix>` of a downloadable artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    name_prefix: String,
    name_suffix: String,
    source: ReleaseSource,
}

impl ArtifactSpec {
    /// Describes artifacts named `<prefix><version><suffix>`.
    #[must_use]
    pub fn new(
        name_prefix: impl Into<String>,
        name_suffix: impl Into<String>,
        source: ReleaseSource,
    ) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            name_suffix: name_suffix.into(),
            source,
        }
    }

    /// Release source.
    #[must_use]
    pub const fn source(&self) -> &ReleaseSource {
        &self.source
    }

    /// File name of `version`.
    #[must_use]
    pub fn file_name(&self, version: &ArtifactVersion) -> String {
        format!("{}{version}{}", self.name_prefix, self.name_suffix)
    }

    /// Extracts the version from an artifact file name.
    ///
    /// All three components must be numeric and the prefix and suffix must
    /// match exactly.
    #[must_use]
    pub fn version_from_file_name(&self, name: &str) -> Option<ArtifactVersion> {
        let middle = name
            .strip_prefix(self.name_prefix.as_str())?
            .strip_suffix(self.name_suffix.as_str())?;
        ArtifactVersion::parse_bare(middle)
    }

    /// Whether a release asset or file named `name` is this artifact.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        name.len() > self.name_prefix.len() + self.name_suffix.len()
            && name.starts_with(self.name_prefix.as_str())
            && name.ends_with(self.name_suffix.as_str())
    }
}

/// An artifact resolved on disk and ready to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeArtifact {
    /// Installed version, when known.
    pub version: Option<ArtifactVersion>,
    /// Path of the artifact file.
    pub path: PathBuf,
    /// Size announced by the registry at download time.
    pub expected_size: Option<u64>,
    /// SHA-256 announced by the registry at download time.
    pub sha256: Option<String>,
}

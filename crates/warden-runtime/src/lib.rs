//! Runtime dependency management for supervised language servers.
//!
//! Each managed server descriptor owns a directory under the shared resources
//! root holding an *active* artifact, an optional *staged* download awaiting
//! promotion, a persisted [`VersionRecord`] and an advisory
//! [`StagingLock`]. The [`RuntimeManager`] resolves the artifact to launch
//! at startup (promoting staged downloads when no session is running and no
//! version is pinned) and refreshes it in the background, throttled through
//! the persisted record so the schedule survives process restarts.
//!
//! Everything that touches the shared directories goes through the staging
//! lock, so independent invocations sharing one installation never observe
//! a half-promoted artifact or a half-written record.

mod artifact;
mod errors;
mod layout;
mod lock;
mod manager;
mod record;
mod registry;
mod version;

pub use artifact::{ArtifactSpec, ReleaseSource, RuntimeArtifact};
pub use errors::DependencyError;
pub use layout::{InstalledArtifact, RuntimeLayout};
pub use lock::StagingLock;
pub use manager::{RefreshOutcome, RuntimeManager, RuntimeSettings, SkipReason};
pub use record::VersionRecord;
pub use registry::{
    GithubReleaseRegistry, Release, ReleaseAsset, ReleaseRegistry, artifact_for_version,
    latest_artifact, next_page, parse_releases,
};
pub use version::{ArtifactVersion, VersionParseError};

#[cfg(test)]
mod tests;

//! On-disk layout of one descriptor's runtime directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::artifact::ArtifactSpec;
use crate::errors::DependencyError;
use crate::version::ArtifactVersion;

const ACTIVE_DIR: &str = "active";
const STAGED_DIR: &str = "staged";
const DOWNLOAD_DIR: &str = "download";
const RECORD_FILE: &str = "version.json";
const LOCK_FILE: &str = "staging.lock";

/// `<resources>/<descriptor-id>/{active,staged,download,version.json,staging.lock}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLayout {
    root: PathBuf,
}

/// An artifact file found in one of the layout directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledArtifact {
    /// File path.
    pub path: PathBuf,
    /// Version parsed from the file name, when it parses.
    pub version: Option<ArtifactVersion>,
}

impl RuntimeLayout {
    /// Layout for `descriptor_id` under `resources_dir`.
    #[must_use]
    pub fn new(resources_dir: &Path, descriptor_id: &str) -> Self {
        Self {
            root: resources_dir.join(descriptor_id),
        }
    }

    /// Descriptor directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of the artifact sessions launch.
    #[must_use]
    pub fn active_dir(&self) -> PathBuf {
        self.root.join(ACTIVE_DIR)
    }

    /// Directory of a verified download awaiting promotion.
    #[must_use]
    pub fn staged_dir(&self) -> PathBuf {
        self.root.join(STAGED_DIR)
    }

    /// Scratch directory for transfers in progress.
    #[must_use]
    pub fn download_dir(&self) -> PathBuf {
        self.root.join(DOWNLOAD_DIR)
    }

    /// `version.json`.
    #[must_use]
    pub fn record_path(&self) -> PathBuf {
        self.root.join(RECORD_FILE)
    }

    /// `staging.lock`.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Creates the descriptor, active and download directories.
    ///
    /// # Errors
    ///
    /// Returns [`DependencyError::Io`] when a directory cannot be created.
    pub fn ensure(&self) -> Result<(), DependencyError> {
        for dir in [self.active_dir(), self.download_dir()] {
            fs::create_dir_all(&dir)
                .map_err(|source| DependencyError::io("create directory", dir.clone(), source))?;
        }
        Ok(())
    }

    /// The newest artifact in `dir`; files whose version does not parse
    /// rank below every parsed version.
    ///
    /// # Errors
    ///
    /// Returns [`DependencyError::Io`] when `dir` exists but cannot be
    /// listed.
    pub fn find_artifact(
        dir: &Path,
        spec: &ArtifactSpec,
    ) -> Result<Option<InstalledArtifact>, DependencyError> {
        Ok(Self::artifacts(dir, spec)?
            .into_iter()
            .max_by_key(|artifact| artifact.version))
    }

    /// Every artifact file in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`DependencyError::Io`] when `dir` exists but cannot be
    /// listed.
    pub fn artifacts(
        dir: &Path,
        spec: &ArtifactSpec,
    ) -> Result<Vec<InstalledArtifact>, DependencyError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(DependencyError::io("list directory", dir, error)),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| DependencyError::io("list directory", dir, source))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if spec.matches(name) {
                found.push(InstalledArtifact {
                    version: spec.version_from_file_name(name),
                    path,
                });
            }
        }
        Ok(found)
    }
}

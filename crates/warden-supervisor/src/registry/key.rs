//! Registry keys: canonical project root plus language.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use warden_lsp::Language;

use crate::errors::RegistryError;

/// Identifies at most one live session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    project: PathBuf,
    language: Language,
}

impl SessionKey {
    /// Canonicalises `project` so that aliases of one directory share a key.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidProject`] when the path does not
    /// resolve.
    pub fn resolve(project: &Path, language: Language) -> Result<Self, RegistryError> {
        let project = fs::canonicalize(project)
            .map_err(|source| RegistryError::invalid_project(project, source))?;
        Ok(Self { project, language })
    }

    /// Canonical project root.
    #[must_use]
    pub fn project(&self) -> &Path {
        &self.project
    }

    /// Language served.
    #[must_use]
    pub const fn language(&self) -> Language {
        self.language
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}@{}", self.language, self.project.display())
    }
}

//! Errors surfaced by the session registry.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use warden_lsp::{Language, StartupError};
use warden_runtime::DependencyError;

/// Failures returned from [`crate::SessionRegistry::acquire`].
///
/// Cloneable so that every caller waiting on one single-flight startup
/// receives the same error.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The language is not recognised or has no descriptor.
    #[error("no language server is registered for '{language}'")]
    UnknownLanguage {
        /// Language as requested.
        language: String,
    },

    /// The project root cannot be resolved.
    #[error("project root {} cannot be resolved: {source}", path.display())]
    InvalidProject {
        /// Path supplied by the caller.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The runtime artifact could not be prepared.
    #[error("failed to prepare the {language} server runtime: {source}")]
    Dependency {
        /// Language being started.
        language: Language,
        /// Underlying dependency error.
        #[source]
        source: DependencyError,
    },

    /// The session failed to start.
    #[error(transparent)]
    Startup(#[from] StartupError),

    /// The startup this caller waited on ended without an outcome.
    #[error("startup of the {language} server was abandoned")]
    StartupAbandoned {
        /// Language being started.
        language: Language,
    },

    /// The registry has been shut down.
    #[error("session registry is shut down")]
    Closed,
}

impl RegistryError {
    pub(crate) fn invalid_project(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::InvalidProject {
            path: path.into(),
            source: Arc::new(source),
        }
    }
}

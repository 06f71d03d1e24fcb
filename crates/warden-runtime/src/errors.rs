//! Errors raised while preparing or refreshing runtime artifacts.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Failures of the runtime dependency manager.
///
/// Cloneable so that single-flight startup can hand the same failure to
/// every waiter.
#[derive(Debug, Clone, Error)]
pub enum DependencyError {
    /// A filesystem operation failed.
    #[error("{action} '{}' failed: {source}", path.display())]
    Io {
        /// What was being done.
        action: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The release registry could not be queried.
    #[error("release registry unavailable: {message}")]
    Registry {
        /// Description of the failure.
        message: String,
    },

    /// Transferring an asset failed.
    #[error("failed to download {asset}: {message}")]
    Download {
        /// Asset name.
        asset: String,
        /// Description of the failure.
        message: String,
    },

    /// A downloaded asset failed its size or checksum check.
    #[error("downloaded {asset} failed verification: {detail}")]
    Verification {
        /// Asset name.
        asset: String,
        /// What did not match.
        detail: String,
    },

    /// Another holder owns the staging lock.
    #[error("staging lock '{}' is held by another process", path.display())]
    LockContention {
        /// Lock file path.
        path: PathBuf,
    },

    /// The staging lock was reclaimed by another holder while in use.
    #[error("staging lock '{}' was taken over by another holder", path.display())]
    LockLost {
        /// Lock file path.
        path: PathBuf,
    },

    /// Nothing is installed and nothing could be installed.
    #[error("no runtime artifact available for {descriptor}: {detail}")]
    Unavailable {
        /// Descriptor identifier.
        descriptor: String,
        /// Why nothing could be resolved.
        detail: String,
    },
}

impl DependencyError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// Whether the failure is transient contention for the staging lock.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }
}

//! Persisted per-descriptor version state.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::Builder;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::warn;

use crate::errors::DependencyError;
use crate::version::ArtifactVersion;

/// Log target for record persistence.
pub(crate) const RECORD_TARGET: &str = "warden_runtime::record";

/// Cap on the exponent applied to the check interval after failures.
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Contents of `version.json`.
///
/// Missing fields take their defaults so partially written or older
/// records remain readable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionRecord {
    /// Version installed in `active/`.
    pub current: Option<ArtifactVersion>,
    /// Version waiting in `staged/`.
    pub staged: Option<ArtifactVersion>,
    /// RFC 3339 time of the last remote check.
    pub last_check: Option<String>,
    /// Version pinned by configuration.
    pub pinned: Option<ArtifactVersion>,
    /// Consecutive failed background refreshes.
    pub failed_checks: u32,
}

impl VersionRecord {
    /// Reads the record at `path`.
    ///
    /// A missing file yields the default record; an unreadable or corrupt
    /// one is logged and also yields the default.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Self::default(),
            Err(error) => {
                warn!(
                    target: RECORD_TARGET,
                    file = %path.display(),
                    %error,
                    "version record unreadable, using defaults"
                );
                return Self::default();
            }
        };
        serde_json::from_slice(&contents).unwrap_or_else(|error| {
            warn!(
                target: RECORD_TARGET,
                file = %path.display(),
                %error,
                "version record corrupt, using defaults"
            );
            Self::default()
        })
    }

    /// Atomically replaces the record at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DependencyError::Io`] when the record cannot be written.
    pub fn store(&self, path: &Path) -> Result<(), DependencyError> {
        let mut payload = serde_json::to_vec_pretty(self).map_err(|error| {
            DependencyError::io("encode version record", path, io::Error::other(error))
        })?;
        payload.push(b'\n');
        atomic_write(path, &payload)
            .map_err(|source| DependencyError::io("write version record", path, source))
    }

    /// Parsed `last_check`; `None` when absent or unparsable.
    #[must_use]
    pub fn last_check_at(&self) -> Option<OffsetDateTime> {
        self.last_check
            .as_deref()
            .and_then(|stamp| OffsetDateTime::parse(stamp, &Rfc3339).ok())
    }

    /// Records a remote check at `now`.
    pub fn stamp_check(&mut self, now: OffsetDateTime) {
        self.last_check = now.format(&Rfc3339).ok();
    }

    /// Interval between checks after the recorded failures.
    #[must_use]
    pub fn throttle(&self, interval: Duration) -> Duration {
        let exponent = self.failed_checks.min(MAX_BACKOFF_EXPONENT);
        interval.saturating_mul(1_u32 << exponent)
    }

    /// Whether a remote check may run at `now`.
    ///
    /// Absent, unparsable and future timestamps all make a check due.
    #[must_use]
    pub fn is_check_due(&self, now: OffsetDateTime, interval: Duration) -> bool {
        let Some(last) = self.last_check_at() else {
            return true;
        };
        Duration::try_from(now - last).map_or(true, |elapsed| elapsed >= self.throttle(interval))
    }
}

/// Writes `contents` to `path` through a synced temporary file in the same
/// directory, so readers never observe a partial record.
pub(crate) fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let directory = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "target path did not have a parent directory",
        )
    })?;
    let mut builder = Builder::new();
    builder.prefix(
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("warden"),
    );
    let mut file = builder.tempfile_in(directory)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;
    Ok(())
}

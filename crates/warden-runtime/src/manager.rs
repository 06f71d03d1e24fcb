//! Startup preparation and background refresh of one descriptor's artifact.
//!
//! Startup never waits on the network when an artifact is installed:
//! discovery of newer releases belongs to [`RuntimeManager::refresh`], which
//! stages verified downloads for promotion at the next startup.

use std::fmt;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tempfile::{Builder, NamedTempFile};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactSpec, RuntimeArtifact};
use crate::errors::DependencyError;
use crate::layout::{InstalledArtifact, RuntimeLayout};
use crate::lock::StagingLock;
use crate::record::VersionRecord;
use crate::registry::{ReleaseAsset, ReleaseRegistry, artifact_for_version, latest_artifact};
use crate::version::ArtifactVersion;

/// Log target for dependency management.
pub(crate) const MANAGER_TARGET: &str = "warden_runtime::manager";

/// Tunables for one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Minimum interval between remote checks.
    pub update_check_interval: Duration,
    /// Age after which a staging lock counts as abandoned.
    pub lock_grace: Duration,
    /// Lock attempts made by startup steps.
    pub lock_attempts: u32,
    /// First delay between lock attempts.
    pub lock_backoff: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            update_check_interval: Duration::from_secs(3_600),
            lock_grace: Duration::from_secs(600),
            lock_attempts: 5,
            lock_backoff: Duration::from_millis(50),
        }
    }
}

/// Why a refresh did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A version is pinned.
    Pinned,
    /// The last check is inside the throttle window.
    Throttled,
    /// Another refresh holds the staging lock.
    Busy,
}

/// Result of one background refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// No remote check was made.
    Skipped(SkipReason),
    /// The active version is the newest.
    UpToDate,
    /// The newest version is already staged.
    AlreadyStaged(ArtifactVersion),
    /// A newer version was downloaded, verified and staged.
    Staged(ArtifactVersion),
    /// A download failed verification and was thrown away.
    Discarded {
        /// Version that failed.
        version: ArtifactVersion,
        /// What did not match.
        reason: String,
    },
    /// The registry or filesystem failed.
    Failed(String),
}

impl fmt::Display for RefreshOutcome {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped(reason) => write!(formatter, "skipped ({reason:?})"),
            Self::UpToDate => formatter.write_str("up to date"),
            Self::AlreadyStaged(version) => write!(formatter, "{version} already staged"),
            Self::Staged(version) => write!(formatter, "staged {version}"),
            Self::Discarded { version, reason } => {
                write!(formatter, "discarded {version}: {reason}")
            }
            Self::Failed(message) => write!(formatter, "failed: {message}"),
        }
    }
}

/// Manages the artifact of one descriptor.
pub struct RuntimeManager {
    descriptor_id: String,
    spec: ArtifactSpec,
    layout: RuntimeLayout,
    registry: Arc<dyn ReleaseRegistry>,
    settings: RuntimeSettings,
    refreshing: AtomicBool,
}

impl fmt::Debug for RuntimeManager {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RuntimeManager")
            .field("descriptor_id", &self.descriptor_id)
            .field("layout", &self.layout)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RuntimeManager {
    /// Creates a manager rooted at `<resources_dir>/<descriptor_id>`.
    #[must_use]
    pub fn new(
        descriptor_id: impl Into<String>,
        spec: ArtifactSpec,
        resources_dir: &Path,
        registry: Arc<dyn ReleaseRegistry>,
        settings: RuntimeSettings,
    ) -> Self {
        let descriptor_id = descriptor_id.into();
        Self {
            layout: RuntimeLayout::new(resources_dir, &descriptor_id),
            descriptor_id,
            spec,
            registry,
            settings,
            refreshing: AtomicBool::new(false),
        }
    }

    /// Directory layout.
    #[must_use]
    pub const fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    /// Current persisted record.
    #[must_use]
    pub fn record(&self) -> VersionRecord {
        VersionRecord::load(&self.layout.record_path())
    }

    /// Runs the startup sequence and returns the artifact to launch.
    ///
    /// Promotion of a staged artifact happens only when nothing is pinned
    /// and `ready_sessions` is zero.
    ///
    /// # Errors
    ///
    /// Returns [`DependencyError::Unavailable`] when nothing is installed
    /// and nothing can be installed, or the I/O failure that prevented it.
    pub fn prepare(
        &self,
        pinned: Option<ArtifactVersion>,
        ready_sessions: usize,
    ) -> Result<RuntimeArtifact, DependencyError> {
        self.layout.ensure()?;
        self.sync_pin(pinned)?;
        match pinned {
            Some(version) => {
                debug!(
                    target: MANAGER_TARGET,
                    descriptor = %self.descriptor_id,
                    %version,
                    "pinned, promotion disabled"
                );
            }
            None if ready_sessions > 0 => {
                debug!(
                    target: MANAGER_TARGET,
                    descriptor = %self.descriptor_id,
                    ready_sessions,
                    "sessions ready, deferring promotion"
                );
            }
            None => self.promote_staged()?,
        }
        let active = RuntimeLayout::find_artifact(&self.layout.active_dir(), &self.spec)?;
        match pinned {
            Some(version) => self.resolve_pinned(version, active),
            None => self.resolve_latest(active),
        }
    }

    fn sync_pin(&self, pinned: Option<ArtifactVersion>) -> Result<(), DependencyError> {
        let path = self.layout.record_path();
        let mut record = VersionRecord::load(&path);
        if record.pinned == pinned {
            return Ok(());
        }
        record.pinned = pinned;
        record.store(&path)
    }

    fn lock(&self) -> Result<StagingLock, DependencyError> {
        StagingLock::acquire_with_backoff(
            &self.layout.lock_path(),
            self.settings.lock_grace,
            self.settings.lock_attempts,
            self.settings.lock_backoff,
        )
    }

    /// Moves a staged artifact into `active/` under the staging lock.
    ///
    /// The new file lands before older ones are removed, so `active/` is
    /// never empty to a concurrent reader.
    fn promote_staged(&self) -> Result<(), DependencyError> {
        let staged_dir = self.layout.staged_dir();
        let record_path = self.layout.record_path();
        if !staged_dir.exists() && self.record().staged.is_none() {
            return Ok(());
        }
        let _lock = match self.lock() {
            Ok(lock) => lock,
            Err(error) if error.is_contention() => {
                warn!(
                    target: MANAGER_TARGET,
                    descriptor = %self.descriptor_id,
                    "staging lock busy, skipping promotion"
                );
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        let mut record = VersionRecord::load(&record_path);
        let Some(staged) = RuntimeLayout::find_artifact(&staged_dir, &self.spec)? else {
            debug!(
                target: MANAGER_TARGET,
                descriptor = %self.descriptor_id,
                "clearing empty staged slot"
            );
            remove_dir(&staged_dir)?;
            if record.staged.take().is_some() {
                record.store(&record_path)?;
            }
            return Ok(());
        };

        let active_dir = self.layout.active_dir();
        let file_name = staged.path.file_name().map(PathBuf::from).unwrap_or_default();
        let target = active_dir.join(file_name);
        fs::rename(&staged.path, &target)
            .map_err(|source| DependencyError::io("promote artifact", target.clone(), source))?;
        self.remove_superseded(&target)?;
        let version = staged.version.or(record.staged);
        record.current = version;
        record.staged = None;
        record.store(&record_path)?;
        remove_dir(&staged_dir)?;
        info!(
            target: MANAGER_TARGET,
            descriptor = %self.descriptor_id,
            version = ?version,
            "promoted staged artifact"
        );
        Ok(())
    }

    fn resolve_pinned(
        &self,
        pinned: ArtifactVersion,
        active: Option<InstalledArtifact>,
    ) -> Result<RuntimeArtifact, DependencyError> {
        if let Some(installed) = active.as_ref().filter(|found| found.version == Some(pinned)) {
            return Ok(self.installed(installed));
        }
        let releases = match self.registry.list_releases() {
            Ok(releases) => releases,
            Err(error) => return self.offline(active, &error),
        };
        if let Some((_, asset)) = artifact_for_version(&releases, &self.spec, &pinned) {
            return self.install(asset, pinned);
        }
        warn!(
            target: MANAGER_TARGET,
            descriptor = %self.descriptor_id,
            %pinned,
            "pinned version not published, falling back to the latest release"
        );
        let Some((release, asset)) = latest_artifact(&releases, &self.spec) else {
            return self.offline(active, &DependencyError::Registry {
                message: String::from("no release carries a matching artifact"),
            });
        };
        match active.as_ref().filter(|found| found.version == Some(release.version)) {
            Some(installed) => Ok(self.installed(installed)),
            None => self.install(asset, release.version),
        }
    }

    fn resolve_latest(
        &self,
        active: Option<InstalledArtifact>,
    ) -> Result<RuntimeArtifact, DependencyError> {
        if let Some(installed) = active.as_ref() {
            return Ok(self.installed(installed));
        }
        let releases = self
            .registry
            .list_releases()
            .map_err(|error| self.unavailable(&error))?;
        let (release, asset) = latest_artifact(&releases, &self.spec).ok_or_else(|| {
            self.unavailable(&DependencyError::Registry {
                message: String::from("no release carries a matching artifact"),
            })
        })?;
        self.install(asset, release.version)
    }

    fn offline(
        &self,
        active: Option<InstalledArtifact>,
        error: &DependencyError,
    ) -> Result<RuntimeArtifact, DependencyError> {
        match active {
            Some(installed) => {
                warn!(
                    target: MANAGER_TARGET,
                    descriptor = %self.descriptor_id,
                    %error,
                    "registry unavailable, using installed artifact"
                );
                Ok(self.installed(&installed))
            }
            None => Err(self.unavailable(error)),
        }
    }

    fn unavailable(&self, error: &DependencyError) -> DependencyError {
        DependencyError::Unavailable {
            descriptor: self.descriptor_id.clone(),
            detail: error.to_string(),
        }
    }

    fn installed(&self, artifact: &InstalledArtifact) -> RuntimeArtifact {
        RuntimeArtifact {
            version: artifact.version.or_else(|| self.record().current),
            path: artifact.path.clone(),
            expected_size: None,
            sha256: None,
        }
    }

    /// Downloads `asset` straight into `active/`, replacing what is there.
    fn install(
        &self,
        asset: &ReleaseAsset,
        version: ArtifactVersion,
    ) -> Result<RuntimeArtifact, DependencyError> {
        let lock = self.lock()?;
        info!(
            target: MANAGER_TARGET,
            descriptor = %self.descriptor_id,
            %version,
            asset = %asset.name,
            "installing runtime artifact"
        );
        let download = self.download(asset, &lock)?;
        let target = self.layout.active_dir().join(self.spec.file_name(&version));
        persist(download, &target)?;
        self.remove_superseded(&target)?;

        let record_path = self.layout.record_path();
        let mut record = VersionRecord::load(&record_path);
        record.current = Some(version);
        record.store(&record_path)?;
        Ok(RuntimeArtifact {
            version: Some(version),
            path: target,
            expected_size: Some(asset.size),
            sha256: asset.sha256.clone(),
        })
    }

    /// Deletes every artifact in `active/` other than `keep`.
    fn remove_superseded(&self, keep: &Path) -> Result<(), DependencyError> {
        let active_dir = self.layout.active_dir();
        for previous in RuntimeLayout::artifacts(&active_dir, &self.spec)? {
            if previous.path == keep {
                continue;
            }
            fs::remove_file(&previous.path).map_err(|source| {
                DependencyError::io("remove artifact", previous.path.clone(), source)
            })?;
        }
        Ok(())
    }

    /// Fetches `asset` into `download/` and verifies it, renewing `lock`
    /// while bytes arrive.
    fn download(
        &self,
        asset: &ReleaseAsset,
        lock: &StagingLock,
    ) -> Result<NamedTempFile, DependencyError> {
        let download_dir = self.layout.download_dir();
        fs::create_dir_all(&download_dir).map_err(|source| {
            DependencyError::io("create directory", download_dir.clone(), source)
        })?;
        let file = Builder::new()
            .prefix(".partial-")
            .tempfile_in(&download_dir)
            .map_err(|source| {
                DependencyError::io("create download", download_dir.clone(), source)
            })?;
        let renewal = LockRenewal::new(lock, self.settings.lock_grace / 4);
        let mut sink = HashingWriter::new(BufWriter::new(file), renewal);
        let fetched = self.registry.fetch(asset, &mut sink);
        if !lock.is_held() {
            return Err(DependencyError::LockLost {
                path: lock.path().to_path_buf(),
            });
        }
        fetched?;
        let (written, digest, writer) = sink.finish();
        let file = writer.into_inner().map_err(|error| {
            DependencyError::io("flush download", download_dir.clone(), error.into_error())
        })?;
        file.as_file()
            .sync_all()
            .map_err(|source| DependencyError::io("sync download", download_dir, source))?;
        verify(asset, written, &digest)?;
        Ok(file)
    }

    /// Checks the registry once and stages a newer artifact.
    pub fn refresh(&self) -> RefreshOutcome {
        self.refresh_at(OffsetDateTime::now_utc())
    }

    /// [`Self::refresh`] with an explicit clock reading.
    pub fn refresh_at(&self, now: OffsetDateTime) -> RefreshOutcome {
        let record_path = self.layout.record_path();
        let record = VersionRecord::load(&record_path);
        if record.pinned.is_some() {
            return RefreshOutcome::Skipped(SkipReason::Pinned);
        }
        if !record.is_check_due(now, self.settings.update_check_interval) {
            debug!(
                target: MANAGER_TARGET,
                descriptor = %self.descriptor_id,
                "update check throttled"
            );
            return RefreshOutcome::Skipped(SkipReason::Throttled);
        }
        if let Err(error) = self.layout.ensure() {
            return RefreshOutcome::Failed(error.to_string());
        }
        let lock = match StagingLock::acquire(&self.layout.lock_path(), self.settings.lock_grace) {
            Ok(lock) => lock,
            Err(error) if error.is_contention() => {
                return RefreshOutcome::Skipped(SkipReason::Busy);
            }
            Err(error) => return RefreshOutcome::Failed(error.to_string()),
        };
        let mut record = VersionRecord::load(&record_path);
        if !record.is_check_due(now, self.settings.update_check_interval) {
            return RefreshOutcome::Skipped(SkipReason::Throttled);
        }
        record.stamp_check(now);

        let outcome = match self.check_and_stage(&record, &lock) {
            Ok((outcome, staged)) => {
                if staged.is_some() {
                    record.staged = staged;
                }
                outcome
            }
            Err(DependencyError::LockLost { .. }) => {
                warn!(
                    target: MANAGER_TARGET,
                    descriptor = %self.descriptor_id,
                    "staging lock taken over during the update check"
                );
                return RefreshOutcome::Skipped(SkipReason::Busy);
            }
            Err(error) => RefreshOutcome::Failed(error.to_string()),
        };
        match &outcome {
            RefreshOutcome::Failed(message) => {
                record.failed_checks = record.failed_checks.saturating_add(1);
                warn!(
                    target: MANAGER_TARGET,
                    descriptor = %self.descriptor_id,
                    failed_checks = record.failed_checks,
                    "update check failed: {message}"
                );
            }
            RefreshOutcome::Discarded { version, reason } => {
                record.failed_checks = record.failed_checks.saturating_add(1);
                warn!(
                    target: MANAGER_TARGET,
                    descriptor = %self.descriptor_id,
                    %version,
                    "discarded unverified download: {reason}"
                );
            }
            _ => record.failed_checks = 0,
        }
        if let Err(error) = record.store(&record_path) {
            warn!(
                target: MANAGER_TARGET,
                descriptor = %self.descriptor_id,
                %error,
                "failed to persist version record"
            );
        }
        info!(
            target: MANAGER_TARGET,
            descriptor = %self.descriptor_id,
            %outcome,
            "update check finished"
        );
        outcome
    }

    fn check_and_stage(
        &self,
        record: &VersionRecord,
        lock: &StagingLock,
    ) -> Result<(RefreshOutcome, Option<ArtifactVersion>), DependencyError> {
        let releases = self.registry.list_releases()?;
        let (release, asset) =
            latest_artifact(&releases, &self.spec).ok_or_else(|| DependencyError::Registry {
                message: String::from("no release carries a matching artifact"),
            })?;
        let latest = release.version;
        if record.current.is_some_and(|current| current >= latest) {
            return Ok((RefreshOutcome::UpToDate, None));
        }
        let staged_dir = self.layout.staged_dir();
        let staged_file = staged_dir.join(self.spec.file_name(&latest));
        if record.staged.is_some_and(|staged| staged >= latest) && staged_file.is_file() {
            return Ok((RefreshOutcome::AlreadyStaged(latest), None));
        }

        let download = match self.download(asset, lock) {
            Ok(download) => download,
            Err(DependencyError::Verification { detail, .. }) => {
                return Ok((
                    RefreshOutcome::Discarded {
                        version: latest,
                        reason: detail,
                    },
                    None,
                ));
            }
            Err(error) => return Err(error),
        };
        remove_dir(&staged_dir)?;
        fs::create_dir_all(&staged_dir).map_err(|source| {
            DependencyError::io("create directory", staged_dir.clone(), source)
        })?;
        persist(download, &staged_file)?;
        Ok((RefreshOutcome::Staged(latest), Some(latest)))
    }

    /// Runs [`Self::refresh`] on a background thread.
    ///
    /// Returns `None` when a refresh for this descriptor is already running
    /// or the thread could not be started.
    pub fn schedule_refresh(self: &Arc<Self>) -> Option<JoinHandle<RefreshOutcome>> {
        if self.refreshing.swap(true, Ordering::SeqCst) {
            debug!(
                target: MANAGER_TARGET,
                descriptor = %self.descriptor_id,
                "refresh already running"
            );
            return None;
        }
        let manager = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("warden-refresh-{}", self.descriptor_id))
            .spawn(move || {
                let _running = RunningRefresh(&manager.refreshing);
                manager.refresh()
            });
        match spawned {
            Ok(handle) => Some(handle),
            Err(error) => {
                self.refreshing.store(false, Ordering::SeqCst);
                warn!(
                    target: MANAGER_TARGET,
                    descriptor = %self.descriptor_id,
                    %error,
                    "failed to start refresh thread"
                );
                None
            }
        }
    }
}

/// Clears the running flag when a refresh thread ends.
struct RunningRefresh<'a>(&'a AtomicBool);

impl Drop for RunningRefresh<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn verify(asset: &ReleaseAsset, written: u64, digest: &str) -> Result<(), DependencyError> {
    if asset.size > 0 && written != asset.size {
        return Err(DependencyError::Verification {
            asset: asset.name.clone(),
            detail: format!("expected {} bytes, received {written}", asset.size),
        });
    }
    if let Some(expected) = asset.sha256.as_deref()
        && !expected.eq_ignore_ascii_case(digest)
    {
        return Err(DependencyError::Verification {
            asset: asset.name.clone(),
            detail: format!("sha256 {digest} does not match {expected}"),
        });
    }
    Ok(())
}

fn persist(download: NamedTempFile, target: &Path) -> Result<(), DependencyError> {
    download
        .persist(target)
        .map(|_| ())
        .map_err(|error| DependencyError::io("move download", target, error.error))
}

fn remove_dir(dir: &Path) -> Result<(), DependencyError> {
    match fs::remove_dir_all(dir) {
        Err(error) if error.kind() != io::ErrorKind::NotFound => {
            Err(DependencyError::io("remove directory", dir, error))
        }
        _ => Ok(()),
    }
}

/// Renews the staging lock at most once per `every` while a transfer runs.
struct LockRenewal<'a> {
    lock: &'a StagingLock,
    every: Duration,
    last: Instant,
}

impl<'a> LockRenewal<'a> {
    fn new(lock: &'a StagingLock, every: Duration) -> Self {
        Self {
            lock,
            every,
            last: Instant::now(),
        }
    }

    fn tick(&mut self) -> io::Result<()> {
        if self.last.elapsed() < self.every {
            return Ok(());
        }
        self.lock.renew().map_err(io::Error::other)?;
        self.last = Instant::now();
        Ok(())
    }
}

/// Counts and hashes bytes on their way to disk.
struct HashingWriter<'a, W> {
    inner: W,
    hasher: Sha256,
    written: u64,
    renewal: LockRenewal<'a>,
}

impl<'a, W: Write> HashingWriter<'a, W> {
    fn new(inner: W, renewal: LockRenewal<'a>) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
            renewal,
        }
    }

    fn finish(self) -> (u64, String, W) {
        (self.written, format!("{:x}", self.hasher.finalize()), self.inner)
    }
}

impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.renewal.tick()?;
        let count = self.inner.write(buf)?;
        let accepted = buf.get(..count).unwrap_or(buf);
        self.hasher.update(accepted);
        self.written = self.written.saturating_add(count as u64);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

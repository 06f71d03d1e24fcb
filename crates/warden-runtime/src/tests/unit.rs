//! Unit tests for startup preparation and background refresh.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rstest::rstest;
use tempfile::TempDir;
use time::OffsetDateTime;

use crate::errors::DependencyError;
use crate::layout::RuntimeLayout;
use crate::lock::StagingLock;
use crate::manager::{RefreshOutcome, RuntimeManager, RuntimeSettings, SkipReason};
use crate::record::VersionRecord;
use crate::registry::{Release, ReleaseAsset, ReleaseRegistry};
use crate::tests::support::{DESCRIPTOR, Fixture, payload_for, runtime, spec, version};

fn record(current: &str, staged: Option<&str>) -> VersionRecord {
    VersionRecord {
        current: Some(version(current)),
        staged: staged.map(version),
        ..VersionRecord::default()
    }
}

#[rstest]
fn pinned_version_is_used_and_staged_artifact_left_alone(runtime: Fixture) {
    runtime.install_active("0.26.0");
    runtime.install_staged("0.29.0");
    runtime.store_record(&record("0.26.0", Some("0.29.0")));

    let artifact = runtime
        .manager
        .prepare(Some(version("0.26.0")), 0)
        .expect("prepare");

    assert_eq!(artifact.version, Some(version("0.26.0")));
    assert!(artifact.path.starts_with(runtime.manager.layout().active_dir()));
    assert!(runtime.staged_exists());
    let stored = runtime.manager.record();
    assert_eq!(stored.staged, Some(version("0.29.0")));
    assert_eq!(stored.pinned, Some(version("0.26.0")));
    assert_eq!(runtime.registry.listings(), 0);
}

#[rstest]
fn staged_artifact_is_promoted_when_nothing_is_running(runtime: Fixture) {
    runtime.install_active("0.26.0");
    runtime.install_staged("0.29.0");
    runtime.store_record(&record("0.26.0", Some("0.29.0")));

    let artifact = runtime.manager.prepare(None, 0).expect("prepare");

    assert_eq!(artifact.version, Some(version("0.29.0")));
    assert_eq!(runtime.active_versions(), ["0.29.0"]);
    assert!(!runtime.staged_exists());
    let stored = runtime.manager.record();
    assert_eq!(stored.current, Some(version("0.29.0")));
    assert_eq!(stored.staged, None);
}

#[rstest]
fn failed_promotion_keeps_the_active_artifact(runtime: Fixture) {
    runtime.install_active("0.26.0");
    runtime.install_staged("0.29.0");
    runtime.store_record(&record("0.26.0", Some("0.29.0")));
    let blocker = runtime
        .manager
        .layout()
        .active_dir()
        .join(spec().file_name(&version("0.29.0")));
    fs::create_dir_all(blocker.join("occupied")).expect("blocking directory");

    let error = runtime.manager.prepare(None, 0).expect_err("rename fails");

    assert!(matches!(error, DependencyError::Io { .. }));
    assert_eq!(runtime.active_versions(), ["0.26.0"]);
    assert_eq!(runtime.manager.record().current, Some(version("0.26.0")));
}

#[rstest]
fn promotion_replaces_the_active_artifact_in_place(runtime: Fixture) {
    runtime.install_active("0.29.0");
    runtime.install_staged("0.29.0");
    runtime.store_record(&record("0.29.0", Some("0.29.0")));

    let artifact = runtime.manager.prepare(None, 0).expect("prepare");

    assert_eq!(artifact.version, Some(version("0.29.0")));
    assert_eq!(runtime.active_versions(), ["0.29.0"]);
    assert!(!runtime.staged_exists());
}

#[rstest]
fn promotion_waits_while_sessions_are_ready(runtime: Fixture) {
    runtime.install_active("0.26.0");
    runtime.install_staged("0.29.0");
    runtime.store_record(&record("0.26.0", Some("0.29.0")));

    let artifact = runtime.manager.prepare(None, 1).expect("prepare");

    assert_eq!(artifact.version, Some(version("0.26.0")));
    assert!(runtime.staged_exists());
    assert_eq!(runtime.manager.record().staged, Some(version("0.29.0")));
}

#[rstest]
fn empty_staged_slot_is_cleared(runtime: Fixture) {
    runtime.install_active("0.26.0");
    runtime.store_record(&record("0.26.0", Some("0.29.0")));
    fs::create_dir_all(runtime.manager.layout().staged_dir()).expect("staged dir");

    let artifact = runtime.manager.prepare(None, 0).expect("prepare");

    assert_eq!(artifact.version, Some(version("0.26.0")));
    assert!(!runtime.staged_exists());
    assert_eq!(runtime.manager.record().staged, None);
}

#[rstest]
fn first_start_installs_the_latest_release(runtime: Fixture) {
    runtime.registry.publish("0.28.0");
    runtime.registry.publish("0.29.0");

    let artifact = runtime.manager.prepare(None, 0).expect("prepare");

    assert_eq!(artifact.version, Some(version("0.29.0")));
    assert!(artifact.expected_size.is_some());
    assert!(artifact.sha256.is_some());
    assert_eq!(runtime.active_versions(), ["0.29.0"]);
    assert_eq!(runtime.manager.record().current, Some(version("0.29.0")));
}

#[rstest]
fn pinned_release_replaces_a_different_active_version(runtime: Fixture) {
    runtime.install_active("0.26.0");
    runtime.store_record(&record("0.26.0", None));
    runtime.registry.publish("0.27.0");
    runtime.registry.publish("0.29.0");

    let artifact = runtime
        .manager
        .prepare(Some(version("0.27.0")), 0)
        .expect("prepare");

    assert_eq!(artifact.version, Some(version("0.27.0")));
    assert_eq!(runtime.active_versions(), ["0.27.0"]);
}

#[rstest]
fn unpublished_pin_falls_back_to_the_latest_release(runtime: Fixture) {
    runtime.registry.publish("0.29.0");

    let artifact = runtime
        .manager
        .prepare(Some(version("0.27.0")), 0)
        .expect("prepare");

    assert_eq!(artifact.version, Some(version("0.29.0")));
}

#[rstest]
fn offline_start_uses_the_installed_artifact(runtime: Fixture) {
    runtime.install_active("0.26.0");
    runtime.registry.set_offline(true);

    let artifact = runtime
        .manager
        .prepare(Some(version("0.27.0")), 0)
        .expect("prepare");

    assert_eq!(artifact.version, Some(version("0.26.0")));
}

#[rstest]
fn offline_start_without_an_artifact_is_unavailable(runtime: Fixture) {
    runtime.registry.set_offline(true);

    let error = runtime.manager.prepare(None, 0).expect_err("nothing to launch");

    assert!(matches!(
        error,
        DependencyError::Unavailable { ref descriptor, .. } if descriptor == DESCRIPTOR
    ));
}

#[rstest]
fn installed_artifact_starts_without_touching_the_registry(runtime: Fixture) {
    runtime.install_active("0.26.0");
    runtime.registry.publish("0.29.0");

    let artifact = runtime.manager.prepare(None, 0).expect("prepare");

    assert_eq!(artifact.version, Some(version("0.26.0")));
    assert_eq!(runtime.registry.listings(), 0);
}

#[rstest]
fn recent_check_throttles_the_refresh(runtime: Fixture) {
    let now = OffsetDateTime::now_utc();
    let mut stored = record("0.26.0", None);
    stored.stamp_check(now - Duration::from_secs(600));
    runtime.store_record(&stored);

    assert_eq!(
        runtime.manager.refresh_at(now),
        RefreshOutcome::Skipped(SkipReason::Throttled)
    );
    assert_eq!(runtime.registry.listings(), 0);
}

#[rstest]
fn pinned_record_skips_the_refresh(runtime: Fixture) {
    let mut stored = record("0.26.0", None);
    stored.pinned = Some(version("0.26.0"));
    runtime.store_record(&stored);

    assert_eq!(
        runtime.manager.refresh(),
        RefreshOutcome::Skipped(SkipReason::Pinned)
    );
    assert_eq!(runtime.registry.listings(), 0);
}

#[rstest]
fn held_lock_makes_the_refresh_busy(runtime: Fixture) {
    runtime.manager.layout().ensure().expect("layout");
    let _held = StagingLock::acquire(
        &runtime.manager.layout().lock_path(),
        Duration::from_secs(600),
    )
    .expect("lock");

    assert_eq!(
        runtime.manager.refresh(),
        RefreshOutcome::Skipped(SkipReason::Busy)
    );
}

#[rstest]
fn newer_release_is_staged_once(runtime: Fixture) {
    let now = OffsetDateTime::now_utc();
    runtime.install_active("0.26.0");
    runtime.store_record(&record("0.26.0", None));
    runtime.registry.publish("0.29.0");

    assert_eq!(
        runtime.manager.refresh_at(now),
        RefreshOutcome::Staged(version("0.29.0"))
    );
    let stored = runtime.manager.record();
    assert_eq!(stored.staged, Some(version("0.29.0")));
    assert_eq!(stored.current, Some(version("0.26.0")));
    assert_eq!(stored.failed_checks, 0);
    assert!(stored.last_check.is_some());

    let later = now + Duration::from_secs(7_200);
    assert_eq!(
        runtime.manager.refresh_at(later),
        RefreshOutcome::AlreadyStaged(version("0.29.0"))
    );
    assert_eq!(runtime.registry.fetches(), 1);
}

#[rstest]
fn current_release_is_up_to_date(runtime: Fixture) {
    runtime.install_active("0.29.0");
    runtime.store_record(&record("0.29.0", None));
    runtime.registry.publish("0.29.0");

    assert_eq!(runtime.manager.refresh(), RefreshOutcome::UpToDate);
    assert_eq!(runtime.registry.fetches(), 0);
}

#[rstest]
fn short_download_is_discarded(runtime: Fixture) {
    runtime.install_active("0.26.0");
    runtime.store_record(&record("0.26.0", None));
    runtime.registry.publish_truncated("0.29.0");

    let outcome = runtime.manager.refresh();

    assert!(
        matches!(outcome, RefreshOutcome::Discarded { version: v, .. } if v == version("0.29.0")),
        "unexpected outcome {outcome:?}"
    );
    let stored = runtime.manager.record();
    assert_eq!(stored.current, Some(version("0.26.0")));
    assert_eq!(stored.staged, None);
    assert_eq!(stored.failed_checks, 1);
    assert!(!runtime.staged_exists());
    let leftovers = fs::read_dir(runtime.manager.layout().download_dir())
        .expect("download dir")
        .count();
    assert_eq!(leftovers, 0);
}

#[rstest]
fn digest_mismatch_is_discarded(runtime: Fixture) {
    runtime.install_active("0.26.0");
    runtime.store_record(&record("0.26.0", None));
    runtime.registry.publish_tampered("0.29.0");

    let outcome = runtime.manager.refresh();

    assert!(
        matches!(&outcome, RefreshOutcome::Discarded { reason, .. } if reason.contains("sha256")),
        "unexpected outcome {outcome:?}"
    );
    assert_eq!(runtime.manager.record().staged, None);
}

#[rstest]
fn failed_checks_stretch_the_throttle(runtime: Fixture) {
    let now = OffsetDateTime::now_utc();
    runtime.store_record(&record("0.26.0", None));
    runtime.registry.set_offline(true);

    assert!(matches!(
        runtime.manager.refresh_at(now),
        RefreshOutcome::Failed(_)
    ));
    assert_eq!(runtime.manager.record().failed_checks, 1);

    let ninety_minutes = now + Duration::from_secs(5_400);
    assert_eq!(
        runtime.manager.refresh_at(ninety_minutes),
        RefreshOutcome::Skipped(SkipReason::Throttled)
    );

    runtime.registry.set_offline(false);
    runtime.registry.publish("0.26.0");
    let three_hours = now + Duration::from_secs(10_800);
    assert_eq!(runtime.manager.refresh_at(three_hours), RefreshOutcome::UpToDate);
    assert_eq!(runtime.manager.record().failed_checks, 0);
}

#[rstest]
fn scheduled_refresh_runs_in_the_background(runtime: Fixture) {
    runtime.install_active("0.26.0");
    runtime.store_record(&record("0.26.0", None));
    runtime.registry.publish("0.29.0");

    let handle = runtime.manager.schedule_refresh().expect("refresh thread");
    let outcome = handle.join().expect("refresh thread panicked");

    assert_eq!(outcome, RefreshOutcome::Staged(version("0.29.0")));
    let again = runtime.manager.schedule_refresh().expect("flag cleared");
    assert_eq!(
        again.join().expect("refresh thread panicked"),
        RefreshOutcome::Skipped(SkipReason::Throttled)
    );
}

#[rstest]
fn staged_refresh_is_promoted_at_the_next_start(runtime: Fixture) {
    runtime.install_active("0.26.0");
    runtime.store_record(&record("0.26.0", None));
    runtime.registry.publish("0.29.0");
    assert_eq!(
        runtime.manager.refresh(),
        RefreshOutcome::Staged(version("0.29.0"))
    );

    let artifact = runtime.manager.prepare(None, 0).expect("prepare");

    assert_eq!(artifact.version, Some(version("0.29.0")));
    assert_eq!(runtime.active_versions(), ["0.29.0"]);
    assert_eq!(
        fs::read(&artifact.path).expect("artifact"),
        payload_for(version("0.29.0"))
    );
}

/// Serves one release a byte at a time and checks, once the transfer ends,
/// whether the staging lock could be taken from under the download.
struct TrickleRegistry {
    payload: Vec<u8>,
    pause: Duration,
    lock_path: PathBuf,
    grace: Duration,
    lock_was_contended: Mutex<Option<bool>>,
}

impl TrickleRegistry {
    fn asset(&self) -> ReleaseAsset {
        ReleaseAsset {
            name: spec().file_name(&version("0.29.0")),
            download_url: String::from("memory://slow"),
            size: self.payload.len() as u64,
            sha256: None,
        }
    }
}

impl ReleaseRegistry for TrickleRegistry {
    fn list_releases(&self) -> Result<Vec<Release>, DependencyError> {
        Ok(vec![Release {
            version: version("0.29.0"),
            tag: String::from("v0.29.0"),
            assets: vec![self.asset()],
        }])
    }

    fn fetch(&self, asset: &ReleaseAsset, sink: &mut dyn Write) -> Result<u64, DependencyError> {
        for byte in &self.payload {
            thread::sleep(self.pause);
            sink.write_all(std::slice::from_ref(byte))
                .map_err(|error| DependencyError::Download {
                    asset: asset.name.clone(),
                    message: error.to_string(),
                })?;
        }
        let contended = matches!(
            StagingLock::acquire(&self.lock_path, self.grace),
            Err(DependencyError::LockContention { .. })
        );
        *self.lock_was_contended.lock().expect("result lock") = Some(contended);
        Ok(self.payload.len() as u64)
    }
}

#[rstest]
fn slow_downloads_keep_the_staging_lock_fresh() {
    let dir = TempDir::new().expect("temp dir");
    let grace = Duration::from_millis(200);
    let registry = Arc::new(TrickleRegistry {
        payload: payload_for(version("0.29.0")),
        pause: Duration::from_millis(30),
        lock_path: RuntimeLayout::new(dir.path(), DESCRIPTOR).lock_path(),
        grace,
        lock_was_contended: Mutex::new(None),
    });
    let shared: Arc<dyn ReleaseRegistry> = registry.clone();
    let settings = RuntimeSettings {
        lock_grace: grace,
        ..RuntimeSettings::default()
    };
    let manager = RuntimeManager::new(DESCRIPTOR, spec(), dir.path(), shared, settings);

    let outcome = manager.refresh();

    assert_eq!(outcome, RefreshOutcome::Staged(version("0.29.0")));
    assert_eq!(
        *registry.lock_was_contended.lock().expect("result lock"),
        Some(true)
    );
    assert!(!manager.layout().lock_path().exists());
}

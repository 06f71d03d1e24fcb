//! In-memory registry and fixtures shared by the manager tests.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rstest::fixture;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::artifact::{ArtifactSpec, ReleaseSource};
use crate::errors::DependencyError;
use crate::manager::{RuntimeManager, RuntimeSettings};
use crate::record::VersionRecord;
use crate::registry::{Release, ReleaseAsset, ReleaseRegistry};
use crate::version::ArtifactVersion;

pub(crate) const DESCRIPTOR: &str = "bsl-language-server";

pub(crate) fn spec() -> ArtifactSpec {
    ArtifactSpec::new(
        "bsl-language-server-",
        "-exec.jar",
        ReleaseSource::github("1c-syntax", "bsl-language-server"),
    )
}

pub(crate) fn version(text: &str) -> ArtifactVersion {
    text.parse().expect("version literal")
}

pub(crate) fn payload_for(version: ArtifactVersion) -> Vec<u8> {
    format!("jar bytes of {version}").into_bytes()
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Release registry served from memory.
#[derive(Default)]
pub(crate) struct FakeRegistry {
    releases: Mutex<Vec<Release>>,
    payloads: Mutex<HashMap<String, Vec<u8>>>,
    offline: AtomicBool,
    listings: AtomicUsize,
    fetches: AtomicUsize,
}

impl FakeRegistry {
    /// Publishes `version` with a correct size and digest.
    pub(crate) fn publish(&self, text: &str) {
        let version = version(text);
        let payload = payload_for(version);
        let asset = ReleaseAsset {
            name: spec().file_name(&version),
            download_url: format!("memory://{version}"),
            size: payload.len() as u64,
            sha256: Some(sha256_hex(&payload)),
        };
        self.push(version, asset, payload);
    }

    /// Publishes `version` announcing one byte more than is served.
    pub(crate) fn publish_truncated(&self, text: &str) {
        let version = version(text);
        let payload = payload_for(version);
        let asset = ReleaseAsset {
            name: spec().file_name(&version),
            download_url: format!("memory://{version}"),
            size: payload.len() as u64 + 1,
            sha256: None,
        };
        self.push(version, asset, payload);
    }

    /// Publishes `version` with a digest that does not match the bytes.
    pub(crate) fn publish_tampered(&self, text: &str) {
        let version = version(text);
        let payload = payload_for(version);
        let asset = ReleaseAsset {
            name: spec().file_name(&version),
            download_url: format!("memory://{version}"),
            size: payload.len() as u64,
            sha256: Some(sha256_hex(b"something else")),
        };
        self.push(version, asset, payload);
    }

    fn push(&self, version: ArtifactVersion, asset: ReleaseAsset, payload: Vec<u8>) {
        self.payloads
            .lock()
            .expect("payloads lock")
            .insert(asset.download_url.clone(), payload);
        let mut releases = self.releases.lock().expect("releases lock");
        releases.push(Release {
            version,
            tag: format!("v{version}"),
            assets: vec![asset],
        });
        releases.sort_by(|left, right| right.version.cmp(&left.version));
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub(crate) fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ReleaseRegistry for FakeRegistry {
    fn list_releases(&self) -> Result<Vec<Release>, DependencyError> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(DependencyError::Registry {
                message: String::from("network unreachable"),
            });
        }
        Ok(self.releases.lock().expect("releases lock").clone())
    }

    fn fetch(&self, asset: &ReleaseAsset, sink: &mut dyn Write) -> Result<u64, DependencyError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let payloads = self.payloads.lock().expect("payloads lock");
        let payload = payloads
            .get(&asset.download_url)
            .ok_or_else(|| DependencyError::Download {
                asset: asset.name.clone(),
                message: String::from("404"),
            })?;
        sink.write_all(payload)
            .map_err(|error| DependencyError::Download {
                asset: asset.name.clone(),
                message: error.to_string(),
            })?;
        Ok(payload.len() as u64)
    }
}

pub(crate) fn fast_settings() -> RuntimeSettings {
    RuntimeSettings {
        update_check_interval: Duration::from_secs(3_600),
        lock_grace: Duration::from_secs(600),
        lock_attempts: 2,
        lock_backoff: Duration::from_millis(5),
    }
}

/// A manager over a temporary resources directory.
pub(crate) struct Fixture {
    _dir: TempDir,
    pub(crate) registry: Arc<FakeRegistry>,
    pub(crate) manager: Arc<RuntimeManager>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let registry = Arc::new(FakeRegistry::default());
        let shared: Arc<dyn ReleaseRegistry> = registry.clone();
        let manager = Arc::new(RuntimeManager::new(
            DESCRIPTOR,
            spec(),
            dir.path(),
            shared,
            fast_settings(),
        ));
        Self {
            _dir: dir,
            registry,
            manager,
        }
    }

    /// Writes an artifact for `text` into `active/`.
    pub(crate) fn install_active(&self, text: &str) {
        let active = self.manager.layout().active_dir();
        write_artifact(&active, text);
    }

    /// Writes an artifact for `text` into `staged/`.
    pub(crate) fn install_staged(&self, text: &str) {
        let staged = self.manager.layout().staged_dir();
        write_artifact(&staged, text);
    }

    pub(crate) fn store_record(&self, record: &VersionRecord) {
        fs::create_dir_all(self.manager.layout().root()).expect("layout root");
        record
            .store(&self.manager.layout().record_path())
            .expect("store record");
    }

    pub(crate) fn active_versions(&self) -> Vec<String> {
        let active = self.manager.layout().active_dir();
        let mut versions: Vec<String> = crate::layout::RuntimeLayout::artifacts(&active, &spec())
            .expect("list active")
            .into_iter()
            .filter_map(|artifact| artifact.version.map(|v| v.to_string()))
            .collect();
        versions.sort();
        versions
    }

    pub(crate) fn staged_exists(&self) -> bool {
        self.manager.layout().staged_dir().exists()
    }
}

fn write_artifact(dir: &Path, text: &str) {
    fs::create_dir_all(dir).expect("artifact dir");
    let version = version(text);
    fs::write(dir.join(spec().file_name(&version)), payload_for(version)).expect("write artifact");
}

#[fixture]
pub(crate) fn runtime() -> Fixture {
    Fixture::new()
}

//! Shared fixtures for registry tests.

mod stub_server;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rstest::fixture;
use tempfile::TempDir;
use time::OffsetDateTime;
use warden_config::{Config, LanguageSettingKey, RestartPolicy, SessionTimeouts};
use warden_lsp::{Language, SessionOptions, SessionState, TerminationReport};
use warden_runtime::{
    ArtifactSpec, ArtifactVersion, DependencyError, Release, ReleaseAsset, ReleaseRegistry,
    RuntimeManager, RuntimeSettings,
};

use crate::bootstrap::BootstrapError;
use crate::catalog::{self, DescriptorCatalog};
use crate::errors::RegistryError;
use crate::health::HealthReporter;
use crate::registry::{RegistrySettings, ReleaseRegistryFactory, SessionKey, SessionRegistry};

pub use stub_server::{HANG_METHOD, StubSpawner};

/// Idle window used unless a test overrides it.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub fn version(text: &str) -> ArtifactVersion {
    text.parse().expect("version literal")
}

/// Collects formatted log lines written while a closure runs.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("log buffer lock")).into_owned()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("log buffer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Runs `action` with warnings on this thread routed into a buffer.
pub fn capture_warnings<T>(action: impl FnOnce() -> T) -> (T, String) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let outcome = tracing::subscriber::with_default(subscriber, action);
    (outcome, buffer.contents())
}

/// Release registry that publishes nothing.
#[derive(Debug, Default)]
pub struct QuietReleases {
    offline: AtomicBool,
    listings: AtomicUsize,
}

impl QuietReleases {
    pub fn set_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }
}

impl ReleaseRegistry for QuietReleases {
    fn list_releases(&self) -> Result<Vec<Release>, DependencyError> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(DependencyError::Registry {
                message: String::from("network unreachable"),
            });
        }
        Ok(Vec::new())
    }

    fn fetch(&self, asset: &ReleaseAsset, _sink: &mut dyn Write) -> Result<u64, DependencyError> {
        Err(DependencyError::Download {
            asset: asset.name.clone(),
            message: String::from("nothing is published"),
        })
    }
}

/// Lifecycle events seen by [`RecordingReporter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    BootstrapStarting,
    BootstrapSucceeded,
    BootstrapFailed,
    Starting(Language),
    Started(Language, SessionState),
    Failed(Language),
    Evicted(Language),
    Terminated(Language),
}

#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<HealthEvent> {
        self.events.lock().expect("events lock").clone()
    }

    fn record(&self, event: HealthEvent) {
        self.events.lock().expect("events lock").push(event);
    }
}

impl HealthReporter for RecordingReporter {
    fn bootstrap_starting(&self) {
        self.record(HealthEvent::BootstrapStarting);
    }

    fn bootstrap_succeeded(&self, _config: &Config) {
        self.record(HealthEvent::BootstrapSucceeded);
    }

    fn bootstrap_failed(&self, _error: &BootstrapError) {
        self.record(HealthEvent::BootstrapFailed);
    }

    fn session_starting(&self, key: &SessionKey) {
        self.record(HealthEvent::Starting(key.language()));
    }

    fn session_started(&self, key: &SessionKey, state: SessionState) {
        self.record(HealthEvent::Started(key.language(), state));
    }

    fn session_failed(&self, key: &SessionKey, _error: &RegistryError) {
        self.record(HealthEvent::Failed(key.language()));
    }

    fn session_evicted(&self, key: &SessionKey) {
        self.record(HealthEvent::Evicted(key.language()));
    }

    fn session_terminated(&self, key: &SessionKey, _report: &TerminationReport) {
        self.record(HealthEvent::Terminated(key.language()));
    }
}

pub fn fast_options() -> SessionOptions {
    SessionOptions {
        timeouts: SessionTimeouts {
            handshake: Duration::from_secs(2),
            request: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(10),
        },
        restart: RestartPolicy {
            max_restarts: 0,
            window: Duration::from_secs(60),
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        },
        client_name: String::from("warden-tests"),
    }
}

/// A registry over temporary project and resources directories.
pub struct Harness {
    projects: TempDir,
    resources: TempDir,
    pub spawner: Arc<StubSpawner>,
    pub releases: Arc<QuietReleases>,
    pub reporter: Arc<RecordingReporter>,
    pub registry: SessionRegistry,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(StubSpawner::default(), |_| {})
    }

    /// Servers take `delay` to answer `initialize`.
    pub fn with_handshake_delay(delay: Duration) -> Self {
        Self::build(StubSpawner::with_handshake_delay(delay), |_| {})
    }

    /// Applies `configure` to the settings before building the registry.
    pub fn configured(configure: impl FnOnce(&mut RegistrySettings)) -> Self {
        Self::build(StubSpawner::default(), configure)
    }

    fn build(spawner: StubSpawner, configure: impl FnOnce(&mut RegistrySettings)) -> Self {
        let projects = TempDir::new().expect("projects dir");
        let resources = TempDir::new().expect("resources dir");
        let mut settings = RegistrySettings {
            session: fast_options(),
            idle_timeout: IDLE_TIMEOUT,
            resources_dir: resources.path().to_path_buf(),
            runtime: RuntimeSettings {
                lock_attempts: 20,
                lock_backoff: Duration::from_millis(5),
                ..RuntimeSettings::default()
            },
            ..RegistrySettings::default()
        };
        configure(&mut settings);
        let spawner = Arc::new(spawner);
        let releases = Arc::new(QuietReleases::default());
        let reporter = Arc::new(RecordingReporter::default());
        let shared = Arc::clone(&releases);
        let factory: ReleaseRegistryFactory =
            Arc::new(move |_: &ArtifactSpec| -> Arc<dyn ReleaseRegistry> { shared.clone() });
        let registry = SessionRegistry::builder(DescriptorCatalog::builtin(), settings)
            .spawner(spawner.clone())
            .release_registries(factory)
            .reporter(reporter.clone())
            .build();
        Self {
            projects,
            resources,
            spawner,
            releases,
            reporter,
            registry,
        }
    }

    /// Creates (if needed) and returns the project directory `name`.
    pub fn project(&self, name: &str) -> PathBuf {
        let path = self.projects.path().join(name);
        fs::create_dir_all(&path).expect("project dir");
        path
    }

    pub fn resources(&self) -> &Path {
        self.resources.path()
    }

    fn bsl_runtime(&self) -> Arc<RuntimeManager> {
        self.registry
            .runtime(Language::Bsl)
            .expect("BSL runtime manager")
    }

    /// Installs the active BSL artifact and records a check made just now,
    /// so background refreshes stay throttled.
    pub fn install_bsl(&self, active: &str) {
        let manager = self.bsl_runtime();
        write_artifact(&manager.layout().active_dir(), active);
        let mut record = manager.record();
        record.current = Some(version(active));
        record.stamp_check(OffsetDateTime::now_utc());
        store(&manager, &record);
    }

    /// Stages a BSL artifact awaiting promotion.
    pub fn stage_bsl(&self, staged: &str) {
        let manager = self.bsl_runtime();
        write_artifact(&manager.layout().staged_dir(), staged);
        let mut record = manager.record();
        record.staged = Some(version(staged));
        store(&manager, &record);
    }

    /// Version the BSL runtime record names as current.
    pub fn current_bsl(&self) -> Option<ArtifactVersion> {
        self.bsl_runtime().record().current
    }

    /// Jar passed to the most recent launch.
    pub fn last_jar(&self) -> String {
        let launches = self.spawner.launches();
        let launch = launches.last().expect("a launch");
        launch
            .args
            .iter()
            .find(|arg| arg.ends_with(".jar"))
            .cloned()
            .expect("jar argument")
    }
}

/// Pins `language` to `value` in `settings`.
pub fn pin(settings: &mut RegistrySettings, language: Language, value: &str) {
    settings
        .languages
        .set(language.as_str(), LanguageSettingKey::Version, value);
}

fn write_artifact(dir: &Path, text: &str) {
    fs::create_dir_all(dir).expect("artifact dir");
    let descriptor = catalog::bsl_language_server();
    let spec = descriptor.managed_artifact().expect("managed descriptor");
    fs::write(dir.join(spec.file_name(&version(text))), text).expect("write artifact");
}

fn store(manager: &RuntimeManager, record: &warden_runtime::VersionRecord) {
    fs::create_dir_all(manager.layout().root()).expect("layout root");
    record
        .store(&manager.layout().record_path())
        .expect("store record");
}

#[fixture]
pub fn harness() -> Harness {
    Harness::new()
}

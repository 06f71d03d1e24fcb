//! Session registry: at most one live session per project and language.
//!
//! [`SessionRegistry::acquire`] is single-flight. The first caller for a key
//! installs a startup cell and performs startup without holding the map
//! lock; concurrent callers block on that cell and receive the same session
//! or a clone of the same error. Sessions are never shut down, and the
//! termination hook never runs, while the map lock is held.

mod key;
mod runtimes;
mod startup;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use warden_config::{
    Config, DEFAULT_IDLE_TIMEOUT_SECS, LanguageSettingsMatrix, default_resources_dir,
};
use warden_lsp::{
    Language, LaunchContext, ProcessSpawner, ProtocolSession, ServerDescriptor, ServerSpawner,
    SessionConfig, SessionOptions, SessionState, TerminationReport,
};
use warden_runtime::{ArtifactVersion, RuntimeManager, RuntimeSettings};

use crate::catalog::DescriptorCatalog;
use crate::errors::RegistryError;
use crate::health::{HealthReporter, StructuredHealthReporter};

pub use key::SessionKey;
pub use runtimes::{ReleaseRegistryFactory, github_releases};

use runtimes::Runtimes;
use startup::{StartupCell, StartupOutcome};

/// Log target for registry operations.
pub(crate) const REGISTRY_TARGET: &str = "warden_supervisor::registry";

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tunables shared by every session the registry starts.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Timeouts and restart budget of each session.
    pub session: SessionOptions,
    /// Inactivity after which a session without in-flight requests is evicted.
    pub idle_timeout: Duration,
    /// Root of the per-descriptor runtime directories.
    pub resources_dir: PathBuf,
    /// Refresh throttle and staging lock tunables.
    pub runtime: RuntimeSettings,
    /// Per-language settings.
    pub languages: LanguageSettingsMatrix,
    /// `JAVA_HOME` used for JVM-hosted servers.
    pub java_home: Option<PathBuf>,
}

impl RegistrySettings {
    /// Settings resolved from configuration and the `JAVA_HOME` environment
    /// variable.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            session: SessionOptions {
                timeouts: config.session_timeouts(),
                restart: config.restart_policy(),
                ..SessionOptions::default()
            },
            idle_timeout: config.idle_timeout(),
            resources_dir: config.resources_dir().clone().into_std_path_buf(),
            runtime: RuntimeSettings {
                update_check_interval: config.update_check_interval(),
                lock_grace: config.lock_grace(),
                ..RuntimeSettings::default()
            },
            languages: config.language_settings(),
            java_home: std::env::var_os("JAVA_HOME")
                .filter(|home| !home.is_empty())
                .map(PathBuf::from),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            resources_dir: default_resources_dir().into_std_path_buf(),
            runtime: RuntimeSettings::default(),
            languages: LanguageSettingsMatrix::default(),
            java_home: None,
        }
    }
}

enum Slot {
    Starting(Arc<StartupCell>),
    Live(Arc<ProtocolSession>),
}

enum Claim {
    Ready(Arc<ProtocolSession>),
    Wait(Arc<StartupCell>),
    Lead(Arc<StartupCell>, Option<Slot>),
}

struct Reaper {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

struct RegistryInner {
    catalog: DescriptorCatalog,
    settings: RegistrySettings,
    spawner: Arc<dyn ServerSpawner>,
    runtimes: Runtimes,
    reporter: Arc<dyn HealthReporter>,
    slots: Mutex<HashMap<SessionKey, Slot>>,
    closed: AtomicBool,
    reaper: Mutex<Option<Reaper>>,
}

/// Assembles a [`SessionRegistry`].
pub struct RegistryBuilder {
    catalog: DescriptorCatalog,
    settings: RegistrySettings,
    spawner: Arc<dyn ServerSpawner>,
    releases: ReleaseRegistryFactory,
    reporter: Arc<dyn HealthReporter>,
}

impl RegistryBuilder {
    /// Spawns servers through `spawner` instead of real processes.
    #[must_use]
    pub fn spawner(mut self, spawner: Arc<dyn ServerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Resolves release registries through `factory` instead of GitHub.
    #[must_use]
    pub fn release_registries(mut self, factory: ReleaseRegistryFactory) -> Self {
        self.releases = factory;
        self
    }

    /// Reports lifecycle events to `reporter`.
    #[must_use]
    pub fn reporter(mut self, reporter: Arc<dyn HealthReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Builds the registry.
    #[must_use]
    pub fn build(self) -> SessionRegistry {
        let runtimes = Runtimes::new(
            self.settings.resources_dir.clone(),
            self.settings.runtime,
            self.releases,
        );
        SessionRegistry {
            inner: Arc::new(RegistryInner {
                catalog: self.catalog,
                settings: self.settings,
                spawner: self.spawner,
                runtimes,
                reporter: self.reporter,
                slots: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                reaper: Mutex::new(None),
            }),
        }
    }
}

/// Maps (project, language) to at most one live [`ProtocolSession`].
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Starts a builder with real process spawning, GitHub release lookups
    /// and tracing-backed health reporting.
    #[must_use]
    pub fn builder(catalog: DescriptorCatalog, settings: RegistrySettings) -> RegistryBuilder {
        RegistryBuilder {
            catalog,
            settings,
            spawner: Arc::new(ProcessSpawner),
            releases: github_releases(),
            reporter: Arc::new(StructuredHealthReporter::new()),
        }
    }

    /// Registry over the built-in catalog configured from `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::builder(
            DescriptorCatalog::builtin(),
            RegistrySettings::from_config(config),
        )
        .build()
    }

    /// Returns the session for `project` and `language`, starting one when
    /// none is live.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownLanguage`] for languages without a
    /// descriptor, and the startup failure otherwise; concurrent callers of
    /// one startup all receive the same error.
    pub fn acquire(
        &self,
        project: &Path,
        language: &str,
    ) -> Result<Arc<ProtocolSession>, RegistryError> {
        let language = language
            .parse::<Language>()
            .map_err(|error| RegistryError::UnknownLanguage {
                language: error.input().to_owned(),
            })?;
        self.acquire_language(project, language)
    }

    /// [`Self::acquire`] for an already parsed language.
    ///
    /// # Errors
    ///
    /// As [`Self::acquire`].
    pub fn acquire_language(
        &self,
        project: &Path,
        language: Language,
    ) -> Result<Arc<ProtocolSession>, RegistryError> {
        RegistryInner::acquire(&self.inner, project, language)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner.slots)
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    /// Whether no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runtime manager of the descriptor serving `language`, when managed.
    #[must_use]
    pub fn runtime(&self, language: Language) -> Option<Arc<RuntimeManager>> {
        let descriptor = self.inner.catalog.get(language)?;
        self.inner.runtimes.manager_for(descriptor)
    }

    /// Shuts down sessions idle since before `now - idle_timeout`.
    ///
    /// Sessions with requests in flight are kept until a later pass.
    /// Returns the number of sessions evicted.
    #[must_use]
    pub fn evict_idle(&self, now: Instant) -> usize {
        self.inner.evict_idle(now)
    }

    /// Runs [`Self::evict_idle`] every `interval` on a background thread.
    ///
    /// Returns `false` when a reaper is already running or the registry is
    /// shut down.
    #[must_use]
    pub fn spawn_reaper(&self, interval: Duration) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut reaper = lock(&self.inner.reaper);
        if reaper.is_some() {
            return false;
        }
        let (stop, stopped) = mpsc::channel::<()>();
        let registry = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name(String::from("warden-reaper"))
            .spawn(move || reap(&registry, &stopped, interval));
        match spawned {
            Ok(handle) => {
                *reaper = Some(Reaper { stop, handle });
                true
            }
            Err(error) => {
                warn!(target: REGISTRY_TARGET, %error, "failed to start idle reaper");
                false
            }
        }
    }

    /// Stops the reaper and shuts down every live session.
    ///
    /// Later calls to [`Self::acquire`] fail with [`RegistryError::Closed`].
    /// Returns the number of sessions shut down.
    #[must_use]
    pub fn shutdown_all(&self) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);
        let reaper = lock(&self.inner.reaper).take();
        if let Some(Reaper { stop, handle }) = reaper {
            drop(stop);
            if handle.join().is_err() {
                warn!(target: REGISTRY_TARGET, "idle reaper panicked");
            }
        }
        let drained: Vec<(SessionKey, Slot)> = lock(&self.inner.slots).drain().collect();
        let mut stopped = 0;
        for (key, slot) in drained {
            let Slot::Live(session) = slot else {
                continue;
            };
            stopped += 1;
            if let Err(error) = session.shutdown(true) {
                warn!(target: REGISTRY_TARGET, %key, %error, "graceful shutdown failed");
            }
        }
        debug!(target: REGISTRY_TARGET, stopped, "registry shut down");
        stopped
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn reap(registry: &Weak<RegistryInner>, stopped: &mpsc::Receiver<()>, interval: Duration) {
    loop {
        match stopped.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                let evicted = registry.evict_idle(Instant::now());
                if evicted > 0 {
                    debug!(target: REGISTRY_TARGET, evicted, "reaper evicted idle sessions");
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

const fn is_finished(state: SessionState) -> bool {
    matches!(state, SessionState::ShuttingDown | SessionState::Terminated)
}

impl RegistryInner {
    fn acquire(
        this: &Arc<Self>,
        project: &Path,
        language: Language,
    ) -> Result<Arc<ProtocolSession>, RegistryError> {
        if this.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Closed);
        }
        let descriptor = this
            .catalog
            .get(language)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownLanguage {
                language: language.to_string(),
            })?;
        let key = SessionKey::resolve(project, language)?;

        let claim = {
            let mut slots = lock(&this.slots);
            match slots.get(&key) {
                Some(Slot::Live(session)) if !is_finished(session.state()) => {
                    Claim::Ready(Arc::clone(session))
                }
                Some(Slot::Starting(cell)) => Claim::Wait(Arc::clone(cell)),
                _ => {
                    let cell = Arc::new(StartupCell::default());
                    let stale = slots.insert(key.clone(), Slot::Starting(Arc::clone(&cell)));
                    Claim::Lead(cell, stale)
                }
            }
        };

        match claim {
            Claim::Ready(session) => Ok(session),
            Claim::Wait(cell) => {
                debug!(target: REGISTRY_TARGET, %key, "waiting on in-progress startup");
                cell.wait()
            }
            Claim::Lead(cell, stale) => {
                if stale.is_some() {
                    debug!(target: REGISTRY_TARGET, %key, "replacing terminated session");
                }
                drop(stale);
                let leader = Leader {
                    registry: this,
                    key: &key,
                    cell,
                    finished: false,
                };
                this.reporter.session_starting(&key);
                let outcome = Self::start_session(this, &key, &descriptor);
                leader.finish(outcome)
            }
        }
    }

    fn start_session(
        this: &Arc<Self>,
        key: &SessionKey,
        descriptor: &Arc<ServerDescriptor>,
    ) -> StartupOutcome {
        let language = key.language();
        let settings = this.settings.languages.settings_for(language.as_str());
        let pinned = settings
            .pinned_version()
            .and_then(|value| {
                value
                    .parse::<ArtifactVersion>()
                    .inspect_err(|error| {
                        warn!(
                            target: REGISTRY_TARGET,
                            %key,
                            pin = value,
                            %error,
                            "ignoring malformed version pin, using the latest release"
                        );
                    })
                    .ok()
            });

        let runtime = this.runtimes.manager_for(descriptor);
        let artifact = match &runtime {
            Some(manager) => {
                let running = this.running_sessions(language, key);
                let artifact = manager
                    .prepare(pinned, running)
                    .map_err(|source| RegistryError::Dependency { language, source })?;
                Some(artifact)
            }
            None => None,
        };

        let context = LaunchContext {
            workspace: key.project(),
            artifact: artifact.as_ref().map(|artifact| artifact.path.as_path()),
            settings: &settings,
            java_home: this.settings.java_home.as_deref(),
        };
        let launch = descriptor.launch_command(&context)?;
        let config = SessionConfig {
            launch,
            options: this.settings.session.clone(),
            spawner: Arc::clone(&this.spawner),
        };
        let session = Arc::new(ProtocolSession::start(
            Arc::clone(descriptor),
            key.project(),
            config,
        )?);
        Self::watch(this, key, &session);

        if let (Some(manager), None) = (runtime, pinned)
            && session.state() == SessionState::Ready
            && manager.schedule_refresh().is_some()
        {
            debug!(target: REGISTRY_TARGET, %key, "scheduled runtime refresh");
        }
        Ok(session)
    }

    /// Sessions of `language` other than `own` that may be using the active
    /// artifact; promotion waits until there are none.
    fn running_sessions(&self, language: Language, own: &SessionKey) -> usize {
        lock(&self.slots)
            .iter()
            .filter(|(key, _)| key.language() == language && *key != own)
            .filter(|(_, slot)| match slot {
                Slot::Starting(_) => true,
                Slot::Live(session) => !is_finished(session.state()),
            })
            .count()
    }

    /// Removes `session` from the map once it terminates.
    fn watch(this: &Arc<Self>, key: &SessionKey, session: &Arc<ProtocolSession>) {
        let registry = Arc::downgrade(this);
        let watched = Arc::downgrade(session);
        let key = key.clone();
        session.on_termination(Arc::new(move |report: &TerminationReport| {
            if let Some(registry) = registry.upgrade() {
                registry.forget(&key, &watched, report);
            }
        }));
    }

    fn forget(
        &self,
        key: &SessionKey,
        watched: &Weak<ProtocolSession>,
        report: &TerminationReport,
    ) {
        let removed = {
            let mut slots = lock(&self.slots);
            match slots.get(key) {
                Some(Slot::Live(session))
                    if std::ptr::eq(Arc::as_ptr(session), watched.as_ptr()) =>
                {
                    slots.remove(key)
                }
                _ => None,
            }
        };
        self.reporter.session_terminated(key, report);
        drop(removed);
    }

    fn evict_idle(&self, now: Instant) -> usize {
        let timeout = self.settings.idle_timeout;
        let evicted: Vec<(SessionKey, Arc<ProtocolSession>)> = {
            let mut slots = lock(&self.slots);
            let idle: Vec<SessionKey> = slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Live(session) if is_idle(session, now, timeout) => Some(key.clone()),
                    _ => None,
                })
                .collect();
            idle.into_iter()
                .filter_map(|key| match slots.remove(&key) {
                    Some(Slot::Live(session)) => Some((key, session)),
                    _ => None,
                })
                .collect()
        };
        for (key, session) in &evicted {
            self.reporter.session_evicted(key);
            if let Err(error) = session.shutdown(true) {
                warn!(
                    target: REGISTRY_TARGET,
                    %key,
                    %error,
                    "graceful shutdown of idle session failed"
                );
            }
        }
        evicted.len()
    }
}

fn is_idle(session: &ProtocolSession, now: Instant, timeout: Duration) -> bool {
    if is_finished(session.state()) {
        return true;
    }
    session.in_flight() == 0 && now.saturating_duration_since(session.last_activity()) >= timeout
}

/// Publishes the startup outcome on every exit path, including unwinding.
struct Leader<'a> {
    registry: &'a RegistryInner,
    key: &'a SessionKey,
    cell: Arc<StartupCell>,
    finished: bool,
}

impl Leader<'_> {
    fn finish(mut self, outcome: StartupOutcome) -> StartupOutcome {
        self.finished = true;
        let registry = self.registry;
        let (outcome, discarded) = {
            let mut slots = lock(&registry.slots);
            let owns_slot = matches!(
                slots.get(self.key),
                Some(Slot::Starting(cell)) if Arc::ptr_eq(cell, &self.cell)
            );
            match outcome {
                Ok(session) if registry.closed.load(Ordering::SeqCst) || !owns_slot => {
                    if owns_slot {
                        slots.remove(self.key);
                    }
                    (Err(RegistryError::Closed), Some(session))
                }
                Ok(session) => {
                    slots.insert(self.key.clone(), Slot::Live(Arc::clone(&session)));
                    (Ok(session), None)
                }
                Err(error) => {
                    if owns_slot {
                        slots.remove(self.key);
                    }
                    (Err(error), None)
                }
            }
        };
        if let Some(session) = discarded
            && let Err(error) = session.shutdown(false)
        {
            debug!(
                target: REGISTRY_TARGET,
                key = %self.key,
                %error,
                "discarding session started during shutdown"
            );
        }
        match &outcome {
            Ok(session) => registry.reporter.session_started(self.key, session.state()),
            Err(error) => registry.reporter.session_failed(self.key, error),
        }
        self.cell.complete(outcome.clone());
        outcome
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let removed = {
            let mut slots = lock(&self.registry.slots);
            match slots.get(self.key) {
                Some(Slot::Starting(cell)) if Arc::ptr_eq(cell, &self.cell) => {
                    slots.remove(self.key)
                }
                _ => None,
            }
        };
        drop(removed);
        self.cell.complete(Err(RegistryError::StartupAbandoned {
            language: self.key.language(),
        }));
    }
}

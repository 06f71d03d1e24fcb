//! Supervisor bootstrap orchestration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ortho_config::{OrthoConfig, OrthoError};
use thiserror::Error;

use warden_config::Config;
use warden_lsp::{ProtocolSession, ServerSpawner};

use crate::catalog::DescriptorCatalog;
use crate::errors::RegistryError;
use crate::health::HealthReporter;
use crate::registry::{RegistrySettings, SessionRegistry};
use crate::telemetry::{self, TelemetryError, TelemetryHandle};

/// Upper bound on the pause between idle sweeps.
const MAX_REAPER_INTERVAL: Duration = Duration::from_secs(60);
const MIN_REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader: Send + Sync {
    /// Loads the supervisor configuration.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Loader that delegates to [`Config::load`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Loader returning a configuration resolved elsewhere.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps `config`.
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// Errors surfaced during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
}

/// Result of a successful bootstrap invocation.
///
/// Dropping the supervisor shuts every session down gracefully.
pub struct Supervisor {
    config: Config,
    registry: SessionRegistry,
    telemetry: TelemetryHandle,
}

impl Supervisor {
    /// Accessor for the resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The session registry.
    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Accessor for the telemetry handle, primarily useful for testing.
    #[must_use]
    pub const fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }

    /// Returns the session serving `language` in `project`, starting it on
    /// demand.
    ///
    /// # Errors
    ///
    /// See [`SessionRegistry::acquire`].
    pub fn acquire(
        &self,
        project: &Path,
        language: &str,
    ) -> Result<Arc<ProtocolSession>, RegistryError> {
        self.registry.acquire(project, language)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let stopped = self.registry.shutdown_all();
        tracing::debug!(
            target: "warden_supervisor::bootstrap",
            stopped,
            "supervisor stopped"
        );
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Supervisor")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Bootstraps the supervisor using the supplied collaborators.
///
/// # Errors
///
/// Returns [`BootstrapError`] when configuration or telemetry cannot be
/// initialised; the reporter observes the failure first.
pub fn bootstrap_with(
    loader: &dyn ConfigLoader,
    reporter: Arc<dyn HealthReporter>,
    spawner: Arc<dyn ServerSpawner>,
) -> Result<Supervisor, BootstrapError> {
    reporter.bootstrap_starting();

    let config = match loader.load() {
        Ok(config) => config,
        Err(source) => {
            let error = BootstrapError::Configuration { source };
            reporter.bootstrap_failed(&error);
            return Err(error);
        }
    };

    let telemetry = match telemetry::initialise(&config.log_settings()) {
        Ok(handle) => handle,
        Err(source) => {
            let error = BootstrapError::Telemetry { source };
            reporter.bootstrap_failed(&error);
            return Err(error);
        }
    };

    let settings = RegistrySettings::from_config(&config);
    let interval = reaper_interval(settings.idle_timeout);
    let registry = SessionRegistry::builder(DescriptorCatalog::builtin(), settings)
        .spawner(spawner)
        .reporter(Arc::clone(&reporter))
        .build();
    if !registry.spawn_reaper(interval) {
        tracing::warn!(
            target: "warden_supervisor::bootstrap",
            "idle sessions will only be evicted on demand"
        );
    }
    reporter.bootstrap_succeeded(&config);

    Ok(Supervisor {
        config,
        registry,
        telemetry,
    })
}

/// Bootstraps the supervisor from the process environment.
///
/// # Errors
///
/// As [`bootstrap_with`].
pub fn bootstrap(reporter: Arc<dyn HealthReporter>) -> Result<Supervisor, BootstrapError> {
    bootstrap_with(
        &SystemConfigLoader,
        reporter,
        Arc::new(warden_lsp::ProcessSpawner),
    )
}

fn reaper_interval(idle_timeout: Duration) -> Duration {
    idle_timeout.clamp(MIN_REAPER_INTERVAL, MAX_REAPER_INTERVAL)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Duration::ZERO, MIN_REAPER_INTERVAL)]
    #[case(Duration::from_secs(5), Duration::from_secs(5))]
    #[case(Duration::from_secs(1_800), MAX_REAPER_INTERVAL)]
    fn reaper_interval_tracks_short_idle_windows(
        #[case] idle_timeout: Duration,
        #[case] expected: Duration,
    ) {
        assert_eq!(reaper_interval(idle_timeout), expected);
    }
}

//! Structured health reporting for supervisor lifecycle events.

use std::sync::Arc;

use warden_config::Config;
use warden_lsp::{SessionState, TerminationReport};

use crate::bootstrap::BootstrapError;
use crate::errors::RegistryError;
use crate::registry::SessionKey;

const HEALTH_TARGET: &str = "warden_supervisor::health";

/// Observer trait used to surface lifecycle events to telemetry sinks.
pub trait HealthReporter: Send + Sync {
    /// Invoked before configuration loading begins.
    fn bootstrap_starting(&self);

    /// Invoked after bootstrap completes successfully.
    fn bootstrap_succeeded(&self, config: &Config);

    /// Invoked when bootstrap fails.
    fn bootstrap_failed(&self, error: &BootstrapError);

    /// Invoked before a session is started for `key`.
    fn session_starting(&self, key: &SessionKey);

    /// Invoked once a started session has settled.
    fn session_started(&self, key: &SessionKey, state: SessionState);

    /// Invoked when a session fails to start.
    fn session_failed(&self, key: &SessionKey, error: &RegistryError);

    /// Invoked when an idle session is evicted.
    fn session_evicted(&self, key: &SessionKey);

    /// Invoked when a session terminates.
    fn session_terminated(&self, key: &SessionKey, report: &TerminationReport);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter,
{
    fn bootstrap_starting(&self) {
        (**self).bootstrap_starting();
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        (**self).bootstrap_succeeded(config);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        (**self).bootstrap_failed(error);
    }

    fn session_starting(&self, key: &SessionKey) {
        (**self).session_starting(key);
    }

    fn session_started(&self, key: &SessionKey, state: SessionState) {
        (**self).session_started(key, state);
    }

    fn session_failed(&self, key: &SessionKey, error: &RegistryError) {
        (**self).session_failed(key, error);
    }

    fn session_evicted(&self, key: &SessionKey) {
        (**self).session_evicted(key);
    }

    fn session_terminated(&self, key: &SessionKey, report: &TerminationReport) {
        (**self).session_terminated(key, report);
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn bootstrap_starting(&self) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_starting",
            "starting supervisor bootstrap"
        );
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_succeeded",
            resources = %config.resources_dir(),
            log_filter = %config.log_filter(),
            log_format = ?config.log_format(),
            "supervisor bootstrap completed"
        );
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "bootstrap_failed",
            error = %error,
            "supervisor bootstrap failed"
        );
    }

    fn session_starting(&self, key: &SessionKey) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "session_starting",
            language = %key.language(),
            project = %key.project().display(),
            "starting language server session"
        );
    }

    fn session_started(&self, key: &SessionKey, state: SessionState) {
        if state == SessionState::Ready {
            tracing::info!(
                target: HEALTH_TARGET,
                event = "session_ready",
                language = %key.language(),
                project = %key.project().display(),
                "language server session ready"
            );
        } else {
            tracing::warn!(
                target: HEALTH_TARGET,
                event = "session_degraded",
                language = %key.language(),
                project = %key.project().display(),
                state = state.as_str(),
                "language server session started without completing the handshake"
            );
        }
    }

    fn session_failed(&self, key: &SessionKey, error: &RegistryError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "session_failed",
            language = %key.language(),
            project = %key.project().display(),
            error = %error,
            "language server session failed to start"
        );
    }

    fn session_evicted(&self, key: &SessionKey) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "session_evicted",
            language = %key.language(),
            project = %key.project().display(),
            "evicting idle language server session"
        );
    }

    fn session_terminated(&self, key: &SessionKey, report: &TerminationReport) {
        tracing::warn!(
            target: HEALTH_TARGET,
            event = "session_terminated",
            language = %key.language(),
            project = %key.project().display(),
            descriptor = %report.descriptor,
            cause = ?report.cause,
            "language server session terminated"
        );
    }
}

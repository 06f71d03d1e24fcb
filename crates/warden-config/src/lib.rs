//! Shared configuration for the Warden language server supervisor.
//!
//! The [`Config`] struct is loaded through `ortho_config`, layering
//! defaults, a configuration file, `WARDEN_*` environment variables and CLI
//! flags in increasing order of precedence. Per-language settings arrive as
//! `language:key=value` directives and are folded into a
//! [`LanguageSettingsMatrix`].

mod defaults;
mod language;
mod logging;

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_LOCK_GRACE_SECS,
    DEFAULT_LOG_FILTER, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_RESTART_BACKOFF_INITIAL_MILLIS,
    DEFAULT_RESTART_BACKOFF_MAX_MILLIS, DEFAULT_RESTART_MAX, DEFAULT_RESTART_WINDOW_SECS,
    DEFAULT_SHUTDOWN_GRACE_MILLIS, DEFAULT_UPDATE_CHECK_INTERVAL_SECS, RestartPolicy,
    SessionTimeouts, default_log_filter, default_log_filter_string, default_log_format,
    default_resources_dir,
};
pub use language::{
    LanguageDirective, LanguageDirectiveParseError, LanguageSettingKey, LanguageSettings,
    LanguageSettingsMatrix,
};
pub use logging::{LogFormat, LogFormatParseError, LogSettings};

/// Configuration consumed by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "WARDEN")]
pub struct Config {
    /// Filter expression applied to tracing output.
    #[ortho_config(default = defaults::default_log_filter_string())]
    pub log_filter: String,
    /// Structured or human-readable log output.
    #[ortho_config(default = defaults::default_log_format())]
    pub log_format: LogFormat,
    /// Root directory for downloaded language server runtimes.
    #[ortho_config(default = defaults::default_resources_dir())]
    pub resources_dir: Utf8PathBuf,
    /// Seconds allowed for the initialize handshake.
    #[ortho_config(default = DEFAULT_HANDSHAKE_TIMEOUT_SECS)]
    pub handshake_timeout_secs: u64,
    /// Seconds a request may wait for its response.
    #[ortho_config(default = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub request_timeout_secs: u64,
    /// Milliseconds a server may take to exit before it is killed.
    #[ortho_config(default = DEFAULT_SHUTDOWN_GRACE_MILLIS)]
    pub shutdown_grace_millis: u64,
    /// Restarts permitted inside the restart window.
    #[ortho_config(default = DEFAULT_RESTART_MAX)]
    pub restart_max: u32,
    /// Rolling restart window in seconds.
    #[ortho_config(default = DEFAULT_RESTART_WINDOW_SECS)]
    pub restart_window_secs: u64,
    /// Initial restart backoff in milliseconds.
    #[ortho_config(default = DEFAULT_RESTART_BACKOFF_INITIAL_MILLIS)]
    pub restart_backoff_initial_millis: u64,
    /// Restart backoff ceiling in milliseconds.
    #[ortho_config(default = DEFAULT_RESTART_BACKOFF_MAX_MILLIS)]
    pub restart_backoff_max_millis: u64,
    /// Inactivity window after which idle sessions are evicted.
    #[ortho_config(default = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout_secs: u64,
    /// Minimum spacing between remote release checks.
    #[ortho_config(default = DEFAULT_UPDATE_CHECK_INTERVAL_SECS)]
    pub update_check_interval_secs: u64,
    /// Age after which a staging lock is reclaimed.
    #[ortho_config(default = DEFAULT_LOCK_GRACE_SECS)]
    pub lock_grace_secs: u64,
    /// Per-language directives (`language:key=value`).
    #[serde(default)]
    #[ortho_config(merge_strategy = "append")]
    pub languages: Vec<LanguageDirective>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            resources_dir: default_resources_dir(),
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            shutdown_grace_millis: DEFAULT_SHUTDOWN_GRACE_MILLIS,
            restart_max: DEFAULT_RESTART_MAX,
            restart_window_secs: DEFAULT_RESTART_WINDOW_SECS,
            restart_backoff_initial_millis: DEFAULT_RESTART_BACKOFF_INITIAL_MILLIS,
            restart_backoff_max_millis: DEFAULT_RESTART_BACKOFF_MAX_MILLIS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            update_check_interval_secs: DEFAULT_UPDATE_CHECK_INTERVAL_SECS,
            lock_grace_secs: DEFAULT_LOCK_GRACE_SECS,
            languages: Vec::new(),
        }
    }
}

impl Config {
    /// Returns the configured log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Returns the configured log format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Bundles the log filter and format for telemetry initialisation.
    #[must_use]
    pub fn log_settings(&self) -> LogSettings {
        LogSettings::new(self.log_filter.clone(), self.log_format)
    }

    /// Directory holding per-descriptor runtime artifacts.
    #[must_use]
    pub fn resources_dir(&self) -> &Utf8PathBuf {
        &self.resources_dir
    }

    /// Timeouts applied to every session.
    #[must_use]
    pub const fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            handshake: Duration::from_secs(self.handshake_timeout_secs),
            request: Duration::from_secs(self.request_timeout_secs),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_millis),
        }
    }

    /// Restart budget and backoff for crashed servers.
    #[must_use]
    pub const fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.restart_max,
            window: Duration::from_secs(self.restart_window_secs),
            initial_backoff: Duration::from_millis(self.restart_backoff_initial_millis),
            max_backoff: Duration::from_millis(self.restart_backoff_max_millis),
        }
    }

    /// Inactivity window after which idle sessions are evicted.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Minimum spacing between remote release checks.
    #[must_use]
    pub const fn update_check_interval(&self) -> Duration {
        Duration::from_secs(self.update_check_interval_secs)
    }

    /// Age after which a staging lock is reclaimed.
    #[must_use]
    pub const fn lock_grace(&self) -> Duration {
        Duration::from_secs(self.lock_grace_secs)
    }

    /// Folds the language directives into a matrix; later directives win.
    #[must_use]
    pub fn language_settings(&self) -> LanguageSettingsMatrix {
        LanguageSettingsMatrix::from_directives(&self.languages)
    }
}

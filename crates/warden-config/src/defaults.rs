use std::env;
use std::time::Duration;

use camino::Utf8PathBuf;
use dirs::data_dir;

use crate::logging::LogFormat;

/// Default log filter expression used by the supervisor.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Seconds allowed for the `initialize` round-trip before a session degrades.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Seconds a single request may wait for its response.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Milliseconds a server is given to exit on its own before it is killed.
pub const DEFAULT_SHUTDOWN_GRACE_MILLIS: u64 = 200;

/// Restarts permitted inside one restart window.
pub const DEFAULT_RESTART_MAX: u32 = 2;

/// Length of the rolling restart window in seconds.
pub const DEFAULT_RESTART_WINDOW_SECS: u64 = 300;

/// First restart delay in milliseconds; doubles per restart in the window.
pub const DEFAULT_RESTART_BACKOFF_INITIAL_MILLIS: u64 = 500;

/// Ceiling applied to the restart delay.
pub const DEFAULT_RESTART_BACKOFF_MAX_MILLIS: u64 = 10_000;

/// Seconds without requests after which a session is evicted.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1_800;

/// Minimum number of seconds between remote release checks per descriptor.
pub const DEFAULT_UPDATE_CHECK_INTERVAL_SECS: u64 = 3_600;

/// Age in seconds after which a staging lock is considered abandoned.
pub const DEFAULT_LOCK_GRACE_SECS: u64 = 600;

/// Default log filter expression used by the supervisor.
#[must_use]
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    String::from(DEFAULT_LOG_FILTER)
}

/// Default logging format.
#[must_use]
pub fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Computes the directory holding downloaded language server runtimes.
///
/// Resolves to `<data dir>/warden/language_servers`, falling back to the
/// system temporary directory when no data directory is available.
#[must_use]
pub fn default_resources_dir() -> Utf8PathBuf {
    let mut base = data_base_directory().unwrap_or_else(fallback_base_directory);
    base.push("warden");
    base.push("language_servers");
    base
}

fn data_base_directory() -> Option<Utf8PathBuf> {
    data_dir().and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
}

fn fallback_base_directory() -> Utf8PathBuf {
    let candidate = env::temp_dir();
    Utf8PathBuf::from_path_buf(candidate).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

/// Restart budget and backoff applied to crashed language servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts permitted within `window`.
    pub max_restarts: u32,
    /// Rolling window over which restarts are counted.
    pub window: Duration,
    /// Delay before the first restart in a window.
    pub initial_backoff: Duration,
    /// Upper bound on the delay between restarts.
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_RESTART_MAX,
            window: Duration::from_secs(DEFAULT_RESTART_WINDOW_SECS),
            initial_backoff: Duration::from_millis(DEFAULT_RESTART_BACKOFF_INITIAL_MILLIS),
            max_backoff: Duration::from_millis(DEFAULT_RESTART_BACKOFF_MAX_MILLIS),
        }
    }
}

/// Timeouts applied to every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Bound on the `initialize` round-trip, and on requests waiting for Ready.
    pub handshake: Duration,
    /// Default bound on a single request.
    pub request: Duration,
    /// Grace period between closing stdin and killing the process.
    pub shutdown_grace: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            request: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MILLIS),
        }
    }
}

//! Shared fixtures and helpers for session tests.

mod scripted_server;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rstest::fixture;
use tempfile::TempDir;
use warden_config::{RestartPolicy, SessionTimeouts};

use crate::capability::FeatureSet;
use crate::descriptor::{ArtifactSource, LaunchTemplate, ServerDescriptor};
use crate::language::Language;
use crate::session::{
    LaunchCommand, ProtocolSession, ServerSpawner, SessionConfig, SessionOptions,
};
use crate::errors::StartupError;

pub use scripted_server::{
    CRASH_METHOD, ECHO_METHOD, HANG_METHOD, ScriptedSpawner, ServerScript, Transcript,
};

/// Timeouts short enough to keep tests quick.
#[must_use]
pub fn fast_options() -> SessionOptions {
    SessionOptions {
        timeouts: SessionTimeouts {
            handshake: Duration::from_millis(500),
            request: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(10),
        },
        restart: RestartPolicy {
            max_restarts: 2,
            window: Duration::from_secs(60),
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        },
        client_name: String::from("warden-tests"),
    }
}

/// Descriptor for the scripted server with every feature opted in.
#[fixture]
pub fn descriptor() -> Arc<ServerDescriptor> {
    Arc::new(
        ServerDescriptor::new(
            "scripted",
            Language::Rust,
            LaunchTemplate::Direct { args: Vec::new() },
            ArtifactSource::OnPath {
                executable: String::from("scripted"),
            },
        )
        .with_opted_in(FeatureSet::all()),
    )
}

/// Temporary project root.
#[fixture]
pub fn workspace() -> TempDir {
    TempDir::new().expect("temp workspace")
}

/// A session backed by a scripted spawner, plus the pieces tests inspect.
pub struct Harness {
    /// Keeps the project root alive.
    pub workspace: TempDir,
    /// Spawner shared with the session.
    pub spawner: Arc<ScriptedSpawner>,
}

impl Harness {
    /// Builds a harness whose servers follow `script`.
    #[must_use]
    pub fn new(script: ServerScript) -> Self {
        Self {
            workspace: workspace(),
            spawner: Arc::new(ScriptedSpawner::new(script)),
        }
    }

    /// Workspace path.
    #[must_use]
    pub fn root(&self) -> PathBuf {
        self.workspace.path().to_path_buf()
    }

    /// Session configuration using the scripted spawner.
    #[must_use]
    pub fn config(&self, options: SessionOptions) -> SessionConfig {
        let spawner: Arc<dyn ServerSpawner> = self.spawner.clone();
        SessionConfig {
            launch: LaunchCommand::new("scripted", self.root()),
            options,
            spawner,
        }
    }

    /// Starts a session with [`fast_options`].
    pub fn start(&self) -> Result<ProtocolSession, StartupError> {
        self.start_with(fast_options())
    }

    /// Starts a session with `options`.
    pub fn start_with(&self, options: SessionOptions) -> Result<ProtocolSession, StartupError> {
        ProtocolSession::start(descriptor(), self.workspace.path(), self.config(options))
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

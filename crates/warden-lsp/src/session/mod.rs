//! Protocol sessions: one supervised language server process each.
//!
//! A [`ProtocolSession`] spawns its server through a [`ServerSpawner`],
//! performs the `initialize` handshake, freezes the negotiated
//! [`CapabilityFlags`], and then correlates concurrent requests with
//! responses read by a dedicated reader thread. Crashes are detected by that
//! thread and handled by a bounded restart loop; once the budget is spent
//! the session terminates and reports to its termination hook.

mod dispatch;
mod handshake;
mod jsonrpc;
mod lifecycle;
mod pending;
mod process;
mod restart;
mod state;
mod transport;

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use lsp_types::{
    Diagnostic, DocumentDiagnosticParams, DocumentDiagnosticReport, PartialResultParams,
    TextDocumentIdentifier, Uri, WorkDoneProgressParams,
};
use serde_json::{Value, json};
use tracing::{debug, warn};
use warden_config::{RestartPolicy, SessionTimeouts};

use crate::capability::{CapabilityFlags, Feature, Gated};
use crate::descriptor::ServerDescriptor;
use crate::errors::{SessionError, StartupError};
use crate::language::Language;

pub use handshake::file_uri;
pub use jsonrpc::{
    IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcReply, JsonRpcRequest,
    METHOD_NOT_FOUND, RequestIds,
};
pub use process::{
    LaunchCommand, ProcessSpawner, ServerProcess, ServerSpawner, SpawnedServer, java_executable,
};
pub use restart::{RestartDecision, RestartTracker};
pub use state::SessionState;
pub use transport::{FrameReader, FrameWriter};

use pending::{PendingTable, Reply};
use state::StateCell;

/// Log target for session operations.
pub(crate) const SESSION_TARGET: &str = "warden_lsp::session";

/// Notifications retained for [`ProtocolSession::drain_notifications`].
pub const NOTIFICATION_CAPACITY: usize = 256;

/// Tunables applied to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Handshake, request and shutdown timeouts.
    pub timeouts: SessionTimeouts,
    /// Restart budget after crashes.
    pub restart: RestartPolicy,
    /// `clientInfo.name` sent during the handshake.
    pub client_name: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeouts: SessionTimeouts::default(),
            restart: RestartPolicy::default(),
            client_name: String::from("warden"),
        }
    }
}

/// Everything [`ProtocolSession::start`] needs besides the descriptor.
#[derive(Clone)]
pub struct SessionConfig {
    /// Resolved launch command.
    pub launch: LaunchCommand,
    /// Session tunables.
    pub options: SessionOptions,
    /// Process factory.
    pub spawner: Arc<dyn ServerSpawner>,
}

/// A notification retained from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerNotification {
    /// Notification method.
    pub method: String,
    /// Parameters, `Null` when absent.
    pub params: Value,
}

/// Why a session reached `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// Deliberate shutdown or eviction.
    Shutdown,
    /// Crashed more often than the restart budget allows.
    RestartBudgetExhausted {
        /// Restarts spent inside the window.
        restarts: u32,
    },
}

/// Delivered to the termination hook once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    /// Descriptor identifier.
    pub descriptor: String,
    /// Language served.
    pub language: Language,
    /// Why the session terminated.
    pub cause: TerminationCause,
}

/// Callback invoked when a session terminates.
pub type TerminationHook = Arc<dyn Fn(&TerminationReport) + Send + Sync>;

/// State shared between callers, the reader thread and the restart loop.
struct Shared {
    descriptor: Arc<ServerDescriptor>,
    root: PathBuf,
    launch: LaunchCommand,
    options: SessionOptions,
    spawner: Arc<dyn ServerSpawner>,
    state: StateCell,
    ids: RequestIds,
    pending: PendingTable,
    process: Mutex<Option<Box<dyn ServerProcess>>>,
    writer: Mutex<Option<FrameWriter<Box<dyn Write + Send>>>>,
    generation: AtomicU64,
    capabilities: OnceLock<CapabilityFlags>,
    notifications: Mutex<VecDeque<ServerNotification>>,
    restarts: Mutex<RestartTracker>,
    last_activity: Mutex<Instant>,
    hook: Mutex<Option<TerminationHook>>,
    report: Mutex<Option<TerminationReport>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn language(&self) -> Language {
        self.descriptor.language()
    }

    fn terminated(&self) -> SessionError {
        SessionError::SessionTerminated {
            language: self.language(),
        }
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn write(&self, payload: &[u8]) -> Result<(), SessionError> {
        let mut writer = lock(&self.writer);
        let Some(writer) = writer.as_mut() else {
            return Err(self.terminated());
        };
        writer.send(payload).map_err(|error| {
            debug!(
                target: SESSION_TARGET,
                server = self.descriptor.id(),
                %error,
                "write to language server failed"
            );
            self.terminated()
        })
    }

    /// Registers and writes a request without consulting the state gate.
    fn issue(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
    ) -> Result<PendingRequest, SessionError> {
        let id = self.ids.next_id();
        let receiver = self.pending.register(id);
        let written = serde_json::to_vec(&JsonRpcRequest::with_id(id, method, params))
            .map_err(|error| SessionError::protocol(format!("failed to encode {method}: {error}")))
            .and_then(|payload| self.write(&payload));
        if let Err(error) = written {
            self.pending.forget(id);
            return Err(error);
        }
        debug!(target: SESSION_TARGET, server = self.descriptor.id(), method, id, "sent request");
        self.touch();
        Ok(PendingRequest {
            id,
            method: method.to_owned(),
            receiver,
            shared: Arc::clone(self),
        })
    }

    fn notify(&self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        let payload = serde_json::to_vec(&JsonRpcNotification::new(method, params)).map_err(
            |error| SessionError::protocol(format!("failed to encode {method}: {error}")),
        )?;
        self.write(&payload)?;
        debug!(target: SESSION_TARGET, server = self.descriptor.id(), method, "sent notification");
        Ok(())
    }

    fn send_cancel(&self, id: i64) {
        if let Err(error) = self.notify("$/cancelRequest", Some(json!({ "id": id }))) {
            debug!(target: SESSION_TARGET, id, %error, "failed to send cancellation");
        }
    }

    /// Blocks until the session can accept requests or fails with the typed
    /// reason it cannot.
    fn await_ready(&self) -> Result<(), SessionError> {
        let mut state = self.state.get();
        if state.is_transitional() {
            state = self.state.wait_settled(self.options.timeouts.handshake);
        }
        match state {
            SessionState::Ready => Ok(()),
            SessionState::ShuttingDown | SessionState::Terminated => Err(self.terminated()),
            SessionState::Degraded
            | SessionState::Uninitialized
            | SessionState::Starting
            | SessionState::Negotiating
            | SessionState::Crashed
            | SessionState::Restarting => Err(SessionError::HandshakeTimeout {
                language: self.language(),
            }),
        }
    }

    /// Records the termination report and invokes the hook once.
    fn deliver(&self, report: TerminationReport) {
        {
            let mut slot = lock(&self.report);
            if slot.is_some() {
                return;
            }
            *slot = Some(report.clone());
        }
        let hook = lock(&self.hook).clone();
        if let Some(hook) = hook {
            hook(&report);
        }
    }
}

/// A request awaiting its response.
pub struct PendingRequest {
    id: i64,
    method: String,
    receiver: Receiver<Reply>,
    shared: Arc<Shared>,
}

impl PendingRequest {
    /// Request id, usable with [`ProtocolSession::cancel`].
    #[must_use]
    pub const fn id(&self) -> i64 {
        self.id
    }

    /// Waits for the response.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::RequestTimeout`] when nothing arrives within
    /// `timeout` (the server is sent `$/cancelRequest`), or the error the
    /// request was resolved with.
    pub fn wait(self, timeout: Duration) -> Result<Value, SessionError> {
        let timed_out = || SessionError::RequestTimeout {
            method: self.method.clone(),
            timeout,
        };
        let outcome = match self.receiver.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                if self.shared.pending.forget(self.id) {
                    self.shared.send_cancel(self.id);
                    Err(timed_out())
                } else {
                    // Resolved between the timeout firing and the removal.
                    self.receiver.try_recv().unwrap_or_else(|_| Err(timed_out()))
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.shared.terminated()),
        };
        self.shared.touch();
        outcome
    }
}

/// A running language server session.
pub struct ProtocolSession {
    shared: Arc<Shared>,
}

impl ProtocolSession {
    /// Spawns the server and performs the handshake.
    ///
    /// Returns a Ready session, or a Degraded one when the handshake does
    /// not complete within the handshake timeout; Degraded sessions fail
    /// every request immediately.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError`] when the workspace is unusable, the process
    /// cannot be spawned, or the server rejects `initialize`.
    pub fn start(
        descriptor: Arc<ServerDescriptor>,
        workspace_root: &Path,
        config: SessionConfig,
    ) -> Result<Self, StartupError> {
        if !workspace_root.is_dir() {
            return Err(StartupError::InvalidWorkspace {
                path: workspace_root.to_path_buf(),
            });
        }
        let restarts = RestartTracker::new(config.options.restart);
        let shared = Arc::new(Shared {
            descriptor,
            root: workspace_root.to_path_buf(),
            launch: config.launch,
            options: config.options,
            spawner: config.spawner,
            state: StateCell::new(),
            ids: RequestIds::new(),
            pending: PendingTable::default(),
            process: Mutex::new(None),
            writer: Mutex::new(None),
            generation: AtomicU64::new(0),
            capabilities: OnceLock::new(),
            notifications: Mutex::new(VecDeque::new()),
            restarts: Mutex::new(restarts),
            last_activity: Mutex::new(Instant::now()),
            hook: Mutex::new(None),
            report: Mutex::new(None),
        });
        lifecycle::start(&shared)?;
        Ok(Self { shared })
    }

    /// Descriptor this session runs.
    #[must_use]
    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.shared.descriptor
    }

    /// Language served.
    #[must_use]
    pub fn language(&self) -> Language {
        self.shared.language()
    }

    /// Project root.
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.shared.root
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state.get()
    }

    /// Waits up to `timeout` for a transitional state to settle.
    #[must_use]
    pub fn wait_until_settled(&self, timeout: Duration) -> SessionState {
        self.shared.state.wait_settled(timeout)
    }

    /// Flags frozen at the first successful handshake.
    #[must_use]
    pub fn capabilities(&self) -> Option<&CapabilityFlags> {
        self.shared.capabilities.get()
    }

    /// Whether `feature` is exposed by this session.
    #[must_use]
    pub fn is_available(&self, feature: Feature) -> bool {
        self.capabilities()
            .is_some_and(|flags| flags.is_available(feature))
    }

    /// Time of the most recent request activity.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *lock(&self.shared.last_activity)
    }

    /// Number of requests awaiting responses.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.pending.len()
    }

    /// Registers the callback invoked when the session terminates.
    ///
    /// Called immediately when the session has already terminated.
    pub fn on_termination(&self, hook: TerminationHook) {
        *lock(&self.shared.hook) = Some(Arc::clone(&hook));
        let report = lock(&self.shared.report).clone();
        if let Some(report) = report {
            hook(&report);
        }
    }

    /// Sends a request and returns a ticket to wait on.
    ///
    /// Requests issued while starting or restarting wait for Ready, bounded
    /// by the handshake timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::HandshakeTimeout`] for degraded sessions or
    /// when Ready is not reached in time, and
    /// [`SessionError::SessionTerminated`] once the session has ended.
    pub fn begin_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<PendingRequest, SessionError> {
        self.shared.await_ready()?;
        self.shared.issue(method, params)
    }

    /// Sends a request and waits up to `timeout` for its response.
    ///
    /// # Errors
    ///
    /// See [`Self::begin_request`] and [`PendingRequest::wait`].
    pub fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        self.begin_request(method, params)?.wait(timeout)
    }

    /// Sends a request using the configured request timeout.
    ///
    /// # Errors
    ///
    /// See [`Self::send_request`].
    pub fn request(&self, method: &str, params: Option<Value>) -> Result<Value, SessionError> {
        self.send_request(method, params, self.shared.options.timeouts.request)
    }

    /// Sends a notification; no response is expected.
    ///
    /// # Errors
    ///
    /// Fails like [`Self::begin_request`] when the session is not usable.
    pub fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), SessionError> {
        self.shared.await_ready()?;
        self.shared.notify(method, params)
    }

    /// Cancels an in-flight request.
    ///
    /// The waiter receives [`SessionError::Cancelled`] and the server is sent
    /// `$/cancelRequest`; the process keeps running. Returns `false` when the
    /// id was not pending.
    pub fn cancel(&self, id: i64) -> bool {
        if !self.shared.pending.resolve(id, Err(SessionError::Cancelled { id })) {
            return false;
        }
        self.shared.send_cancel(id);
        true
    }

    /// Runs `method` only when `feature` passes the capability gate.
    ///
    /// # Errors
    ///
    /// Fails like [`Self::request`]; a closed gate is not an error.
    pub fn request_gated(
        &self,
        feature: Feature,
        method: &str,
        params: Option<Value>,
    ) -> Result<Gated<Value>, SessionError> {
        self.shared.await_ready()?;
        let Some(flags) = self.capabilities() else {
            return Err(SessionError::HandshakeTimeout {
                language: self.language(),
            });
        };
        if let Err(unavailable) = flags.check(feature) {
            debug!(
                target: SESSION_TARGET,
                server = self.shared.descriptor.id(),
                %unavailable,
                "capability gate closed"
            );
            return Ok(Gated::Unavailable(unavailable));
        }
        self.request(method, params).map(Gated::Available)
    }

    /// Pulls diagnostics for `uri`; empty when diagnostics are unavailable.
    ///
    /// # Errors
    ///
    /// Fails like [`Self::request`], or with [`SessionError::Protocol`] for
    /// an unreadable report.
    pub fn pull_diagnostics(&self, uri: Uri) -> Result<Vec<Diagnostic>, SessionError> {
        let params = DocumentDiagnosticParams {
            text_document: TextDocumentIdentifier { uri },
            identifier: None,
            previous_result_id: None,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        let params = serde_json::to_value(params)
            .map_err(|error| SessionError::protocol(format!("failed to encode params: {error}")))?;
        let gated =
            self.request_gated(Feature::Diagnostics, "textDocument/diagnostic", Some(params))?;
        let report = match gated {
            Gated::Unavailable(_) | Gated::Available(Value::Null) => return Ok(Vec::new()),
            Gated::Available(value) => value,
        };
        let report: DocumentDiagnosticReport = serde_json::from_value(report).map_err(|error| {
            SessionError::protocol(format!("malformed diagnostic report: {error}"))
        })?;
        Ok(match report {
            DocumentDiagnosticReport::Full(full) => full.full_document_diagnostic_report.items,
            DocumentDiagnosticReport::Unchanged(_) => Vec::new(),
        })
    }

    /// Takes every retained notification, oldest first.
    #[must_use]
    pub fn drain_notifications(&self) -> Vec<ServerNotification> {
        lock(&self.shared.notifications).drain(..).collect()
    }

    /// Shuts the session down.
    ///
    /// With `graceful`, a Ready session is sent `shutdown` and `exit` first.
    /// On every path, including a failed graceful exchange, the process is
    /// terminated and every pending request fails with
    /// [`SessionError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns the failure of the graceful exchange, after teardown.
    pub fn shutdown(&self, graceful: bool) -> Result<(), SessionError> {
        lifecycle::shutdown(&self.shared, graceful)
    }
}

impl Drop for ProtocolSession {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown(false) {
            warn!(target: SESSION_TARGET, %error, "teardown on drop failed");
        }
    }
}

impl std::fmt::Debug for ProtocolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSession")
            .field("descriptor", &self.shared.descriptor.id())
            .field("root", &self.shared.root)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

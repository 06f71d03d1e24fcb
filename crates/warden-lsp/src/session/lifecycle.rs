//! Launch, crash supervision and teardown of session processes.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use serde_json::json;
use tracing::{debug, error, info, warn};

use super::dispatch::spawn_reader;
use super::handshake::{initialize_params, negotiate};
use super::process::terminate_process;
use super::restart::RestartDecision;
use super::state::SessionState;
use super::transport::FrameWriter;
use super::{SESSION_TARGET, Shared, TerminationCause, TerminationReport, lock};
use crate::errors::{SessionError, StartupError};

/// Why an incarnation did not reach Ready.
#[derive(Debug)]
enum LaunchFailure {
    /// The process or handshake failed outright.
    Startup(StartupError),
    /// `initialize` went unanswered for the handshake timeout.
    HandshakeTimedOut,
    /// A shutdown began while launching.
    Aborted,
}

impl LaunchFailure {
    fn handshake(shared: &Shared, source: SessionError) -> Self {
        Self::Startup(StartupError::Handshake {
            language: shared.language(),
            source,
        })
    }
}

/// Brings a freshly constructed session to Ready or Degraded.
pub(super) fn start(shared: &Arc<Shared>) -> Result<(), StartupError> {
    if let Err(invalid) = shared.state.transition(SessionState::Starting) {
        return Err(StartupError::Handshake {
            language: shared.language(),
            source: SessionError::protocol(format!(
                "cannot start from {}",
                invalid.from
            )),
        });
    }
    match launch(shared) {
        Ok(()) => Ok(()),
        Err(LaunchFailure::HandshakeTimedOut) => {
            warn!(
                target: SESSION_TARGET,
                server = shared.descriptor.id(),
                timeout = ?shared.options.timeouts.handshake,
                "handshake timed out, session degraded"
            );
            if shared.state.transition(SessionState::Degraded).is_ok() {
                release_process(shared);
            }
            Ok(())
        }
        Err(LaunchFailure::Startup(failure)) => {
            abandon(shared);
            Err(failure)
        }
        Err(LaunchFailure::Aborted) => {
            abandon(shared);
            Err(StartupError::Handshake {
                language: shared.language(),
                source: shared.terminated(),
            })
        }
    }
}

/// Tears down a session whose first launch failed.
fn abandon(shared: &Shared) {
    release_process(shared);
    shared.pending.fail_all(|_| shared.terminated());
    if shared.state.transition(SessionState::Terminated).is_err() {
        debug!(
            target: SESSION_TARGET,
            state = %shared.state.get(),
            "session already leaving after failed start"
        );
    }
}

/// Spawns one incarnation and performs its handshake.
///
/// Expects the state to be Starting and leaves it Ready on success.
fn launch(shared: &Arc<Shared>) -> Result<(), LaunchFailure> {
    let spawned = shared
        .spawner
        .spawn(&shared.launch)
        .map_err(LaunchFailure::Startup)?;
    let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
    {
        let mut process = lock(&shared.process);
        if shared.state.get() != SessionState::Starting {
            drop(process);
            let mut orphan = spawned.process;
            terminate_process(
                orphan.as_mut(),
                shared.options.timeouts.shutdown_grace,
                shared.descriptor.id(),
            );
            return Err(LaunchFailure::Aborted);
        }
        *lock(&shared.writer) = Some(FrameWriter::new(spawned.writer));
        *process = Some(spawned.process);
    }
    spawn_reader(Arc::clone(shared), spawned.reader, generation).map_err(|source| {
        LaunchFailure::Startup(StartupError::SpawnFailed {
            message: String::from("failed to start reader thread"),
            source: Arc::new(source),
        })
    })?;

    shared
        .state
        .transition_from(SessionState::Starting, SessionState::Negotiating)
        .map_err(|_| LaunchFailure::Aborted)?;

    let params = initialize_params(&shared.descriptor, &shared.root, &shared.options.client_name)
        .map_err(|source| LaunchFailure::handshake(shared, source))?;
    let result = shared
        .issue("initialize", Some(params))
        .and_then(|ticket| ticket.wait(shared.options.timeouts.handshake));
    let result = match result {
        Ok(result) => result,
        Err(SessionError::RequestTimeout { .. }) => return Err(LaunchFailure::HandshakeTimedOut),
        Err(_) if shared.state.get() == SessionState::ShuttingDown => {
            return Err(LaunchFailure::Aborted);
        }
        Err(source) => return Err(LaunchFailure::handshake(shared, source)),
    };
    let flags = negotiate(&result, shared.descriptor.opted_in())
        .map_err(|source| LaunchFailure::handshake(shared, source))?;
    shared
        .notify("initialized", Some(json!({})))
        .map_err(|source| LaunchFailure::handshake(shared, source))?;

    if shared.capabilities.set(flags).is_err() {
        debug!(
            target: SESSION_TARGET,
            server = shared.descriptor.id(),
            "keeping capabilities from the first handshake"
        );
    }
    shared
        .state
        .transition_from(SessionState::Negotiating, SessionState::Ready)
        .map_err(|_| LaunchFailure::Aborted)?;
    shared.touch();
    info!(
        target: SESSION_TARGET,
        server = shared.descriptor.id(),
        root = %shared.root.display(),
        generation,
        "language server ready"
    );
    Ok(())
}

/// Detaches and stops the current process, closing its stdin first.
pub(super) fn release_process(shared: &Shared) {
    let (process, writer) = {
        let mut process = lock(&shared.process);
        (process.take(), lock(&shared.writer).take())
    };
    drop(writer);
    if let Some(mut process) = process {
        terminate_process(
            process.as_mut(),
            shared.options.timeouts.shutdown_grace,
            shared.descriptor.id(),
        );
    }
}

/// Called by a reader thread once its stream has closed.
pub(super) fn on_reader_exit(shared: &Arc<Shared>, generation: u64) {
    if shared.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    match shared.state.get() {
        SessionState::Starting | SessionState::Negotiating => {
            // The launching thread observes the failure through its
            // pending initialize request.
            shared.pending.fail_all(|_| shared.terminated());
        }
        SessionState::Ready => {
            if shared
                .state
                .transition_from(SessionState::Ready, SessionState::Crashed)
                .is_ok()
            {
                warn!(
                    target: SESSION_TARGET,
                    server = shared.descriptor.id(),
                    generation,
                    "language server exited unexpectedly"
                );
                release_process(shared);
                let failed = shared.pending.fail_all(|_| shared.terminated());
                debug!(target: SESSION_TARGET, failed, "failed in-flight requests after crash");
                supervise_restarts(shared);
            }
        }
        SessionState::Uninitialized
        | SessionState::Degraded
        | SessionState::Crashed
        | SessionState::Restarting
        | SessionState::ShuttingDown
        | SessionState::Terminated => {}
    }
}

/// Restarts a crashed session until it is Ready or the budget is spent.
fn supervise_restarts(shared: &Arc<Shared>) {
    loop {
        let decision = lock(&shared.restarts).record_crash(Instant::now());
        match decision {
            RestartDecision::GiveUp { restarts } => {
                give_up(shared, restarts);
                return;
            }
            RestartDecision::Restart { attempt, delay } => {
                if shared
                    .state
                    .transition_from(SessionState::Crashed, SessionState::Restarting)
                    .is_err()
                {
                    return;
                }
                info!(
                    target: SESSION_TARGET,
                    server = shared.descriptor.id(),
                    attempt,
                    delay = ?delay,
                    "restarting language server"
                );
                if shared.state.wait_while(SessionState::Restarting, delay)
                    != SessionState::Restarting
                {
                    return;
                }
                if shared
                    .state
                    .transition_from(SessionState::Restarting, SessionState::Starting)
                    .is_err()
                {
                    return;
                }
                match launch(shared) {
                    Ok(()) | Err(LaunchFailure::Aborted) => return,
                    Err(failure) => {
                        warn!(
                            target: SESSION_TARGET,
                            server = shared.descriptor.id(),
                            attempt,
                            ?failure,
                            "restart attempt failed"
                        );
                        release_process(shared);
                        shared.pending.fail_all(|_| shared.terminated());
                        if shared.state.transition(SessionState::Crashed).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn give_up(shared: &Shared, restarts: u32) {
    if shared
        .state
        .transition_from(SessionState::Crashed, SessionState::Terminated)
        .is_err()
    {
        return;
    }
    error!(
        target: SESSION_TARGET,
        server = shared.descriptor.id(),
        restarts,
        window = ?shared.options.restart.window,
        "restart budget exhausted, session terminated"
    );
    shared.pending.fail_all(|_| shared.terminated());
    shared.deliver(TerminationReport {
        descriptor: shared.descriptor.id().to_owned(),
        language: shared.language(),
        cause: TerminationCause::RestartBudgetExhausted { restarts },
    });
}

/// Finishes a shutdown on every exit path of [`shutdown`].
struct Teardown<'a> {
    shared: &'a Shared,
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        let shared = self.shared;
        release_process(shared);
        let cancelled = shared.pending.fail_all(|id| SessionError::Cancelled { id });
        if shared.state.transition(SessionState::Terminated).is_err() {
            debug!(
                target: SESSION_TARGET,
                state = %shared.state.get(),
                "teardown found session already terminated"
            );
        }
        info!(
            target: SESSION_TARGET,
            server = shared.descriptor.id(),
            cancelled,
            "language server session shut down"
        );
        shared.deliver(TerminationReport {
            descriptor: shared.descriptor.id().to_owned(),
            language: shared.language(),
            cause: TerminationCause::Shutdown,
        });
    }
}

pub(super) fn shutdown(shared: &Arc<Shared>, graceful: bool) -> Result<(), SessionError> {
    let Ok(previous) = shared.state.transition(SessionState::ShuttingDown) else {
        return Ok(());
    };
    let _teardown = Teardown { shared };
    if !graceful || previous != SessionState::Ready {
        return Ok(());
    }
    debug!(target: SESSION_TARGET, server = shared.descriptor.id(), "sending shutdown request");
    let outcome = shared
        .issue("shutdown", None)
        .and_then(|ticket| ticket.wait(shared.options.timeouts.handshake));
    let exit = shared.notify("exit", None);
    outcome?;
    exit
}

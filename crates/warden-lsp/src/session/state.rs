//! Session lifecycle states and the serialised cell that holds them.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Lifecycle of a protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, no process yet.
    Uninitialized,
    /// Spawning the server process.
    Starting,
    /// `initialize` sent, awaiting the response.
    Negotiating,
    /// Handshake complete; requests are accepted.
    Ready,
    /// Handshake timed out; requests fail fast.
    Degraded,
    /// The process exited unexpectedly.
    Crashed,
    /// Waiting out the backoff before respawning.
    Restarting,
    /// Tearing down.
    ShuttingDown,
    /// Finished; terminal.
    Terminated,
}

impl SessionState {
    /// Whether `next` is a legal successor.
    ///
    /// `ShuttingDown` is reachable from every non-terminal state.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{
            Crashed, Degraded, Negotiating, Ready, Restarting, ShuttingDown, Starting, Terminated,
            Uninitialized,
        };
        match (self, next) {
            (Terminated, _) => false,
            (ShuttingDown, Terminated) => true,
            (ShuttingDown, _) => false,
            (_, ShuttingDown) => true,
            (Uninitialized, Starting)
            | (Starting, Negotiating | Crashed | Terminated)
            | (Negotiating, Ready | Degraded | Crashed | Terminated)
            | (Ready, Crashed)
            | (Crashed, Restarting | Terminated)
            | (Restarting, Starting) => true,
            _ => false,
        }
    }

    /// Whether the state may still change on its own towards Ready.
    #[must_use]
    pub const fn is_transitional(self) -> bool {
        matches!(
            self,
            Self::Uninitialized
                | Self::Starting
                | Self::Negotiating
                | Self::Crashed
                | Self::Restarting
        )
    }

    /// Lower-case label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Negotiating => "negotiating",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Crashed => "crashed",
            Self::Restarting => "restarting",
            Self::ShuttingDown => "shutting_down",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// A rejected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InvalidTransition {
    pub(crate) from: SessionState,
    pub(crate) to: SessionState,
}

/// State guarded by a mutex, with a condition variable for observers.
pub(crate) struct StateCell {
    state: Mutex<SessionState>,
    changed: Condvar,
}

impl StateCell {
    pub(crate) const fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Uninitialized),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.lock()
    }

    /// Moves to `next`, returning the previous state.
    pub(crate) fn transition(&self, next: SessionState) -> Result<SessionState, InvalidTransition> {
        let mut guard = self.lock();
        let current = *guard;
        if !current.can_transition_to(next) {
            return Err(InvalidTransition {
                from: current,
                to: next,
            });
        }
        *guard = next;
        drop(guard);
        self.changed.notify_all();
        Ok(current)
    }

    /// Moves to `next` only when the current state is `expected`.
    pub(crate) fn transition_from(
        &self,
        expected: SessionState,
        next: SessionState,
    ) -> Result<(), InvalidTransition> {
        let mut guard = self.lock();
        let current = *guard;
        if current != expected || !current.can_transition_to(next) {
            return Err(InvalidTransition {
                from: current,
                to: next,
            });
        }
        *guard = next;
        drop(guard);
        self.changed.notify_all();
        Ok(())
    }

    /// Blocks while the state is transitional, for at most `timeout`.
    pub(crate) fn wait_settled(&self, timeout: Duration) -> SessionState {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        while guard.is_transitional() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = match self.changed.wait_timeout(guard, deadline - now) {
                Ok((next, _)) => next,
                Err(poison) => poison.into_inner().0,
            };
        }
        *guard
    }

    /// Blocks until the state leaves `state` or `timeout` elapses.
    pub(crate) fn wait_while(&self, state: SessionState, timeout: Duration) -> SessionState {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        while *guard == state {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = match self.changed.wait_timeout(guard, deadline - now) {
                Ok((next, _)) => next,
                Err(poison) => poison.into_inner().0,
            };
        }
        *guard
    }
}

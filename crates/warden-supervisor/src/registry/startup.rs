//! Single-flight startup: one caller starts, the rest wait for its outcome.

use std::sync::{Arc, Condvar, Mutex};

use warden_lsp::ProtocolSession;

use super::lock;
use crate::errors::RegistryError;

/// What every caller of one startup receives.
pub(crate) type StartupOutcome = Result<Arc<ProtocolSession>, RegistryError>;

/// Rendezvous between the starting caller and everyone waiting on it.
#[derive(Default)]
pub(crate) struct StartupCell {
    outcome: Mutex<Option<StartupOutcome>>,
    settled: Condvar,
}

impl StartupCell {
    /// Publishes `outcome`; only the first call has any effect.
    pub(crate) fn complete(&self, outcome: StartupOutcome) {
        let mut slot = lock(&self.outcome);
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.settled.notify_all();
    }

    /// Blocks until the outcome is published.
    pub(crate) fn wait(&self) -> StartupOutcome {
        let slot = lock(&self.outcome);
        let slot = self
            .settled
            .wait_while(slot, |outcome| outcome.is_none())
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match slot.as_ref() {
            Some(outcome) => outcome.clone(),
            None => Err(RegistryError::Closed),
        }
    }
}

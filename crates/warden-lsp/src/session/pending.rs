//! Table correlating outstanding request ids with their waiters.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, SyncSender};

use serde_json::Value;

use crate::errors::SessionError;

/// Outcome delivered to a waiting caller.
pub(crate) type Reply = Result<Value, SessionError>;

/// Outstanding requests keyed by id.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<i64, SyncSender<Reply>>>,
}

impl PendingTable {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<i64, SyncSender<Reply>>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Registers `id` and returns the receiving half for its reply.
    pub(crate) fn register(&self, id: i64) -> Receiver<Reply> {
        let (sender, receiver) = mpsc::sync_channel(1);
        self.entries().insert(id, sender);
        receiver
    }

    /// Delivers `reply` to the waiter for `id`. Returns `false` for unknown ids.
    pub(crate) fn resolve(&self, id: i64, reply: Reply) -> bool {
        let Some(sender) = self.entries().remove(&id) else {
            return false;
        };
        // The waiter may have given up already; that is not an error.
        sender.try_send(reply).is_ok()
    }

    /// Removes `id` without replying. Returns `true` when it was present.
    pub(crate) fn forget(&self, id: i64) -> bool {
        self.entries().remove(&id).is_some()
    }

    /// Fails every outstanding request with the error built by `error`.
    pub(crate) fn fail_all(&self, error: impl Fn(i64) -> SessionError) -> usize {
        let drained: Vec<(i64, SyncSender<Reply>)> = self.entries().drain().collect();
        let count = drained.len();
        for (id, sender) in drained {
            let _delivered = sender.try_send(Err(error(id)));
        }
        count
    }

    /// Whether `id` is outstanding.
    #[cfg(test)]
    pub(crate) fn contains(&self, id: i64) -> bool {
        self.entries().contains_key(&id)
    }

    /// Number of outstanding requests.
    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }
}

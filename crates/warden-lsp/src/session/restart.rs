//! Restart budget for crashed servers.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use warden_config::RestartPolicy;

/// What to do after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Respawn after `delay`; `attempt` counts restarts in the current window.
    Restart {
        /// One-based restart number within the window.
        attempt: u32,
        /// Backoff to wait before respawning.
        delay: Duration,
    },
    /// The budget is exhausted.
    GiveUp {
        /// Restarts already spent in the window.
        restarts: u32,
    },
}

/// Counts restarts inside a rolling window.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicy,
    history: VecDeque<Instant>,
}

impl RestartTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub const fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            history: VecDeque::new(),
        }
    }

    /// Records a crash observed at `now` and decides whether to restart.
    pub fn record_crash(&mut self, now: Instant) -> RestartDecision {
        while let Some(oldest) = self.history.front() {
            if now.saturating_duration_since(*oldest) > self.policy.window {
                self.history.pop_front();
            } else {
                break;
            }
        }

        let spent = u32::try_from(self.history.len()).unwrap_or(u32::MAX);
        if spent >= self.policy.max_restarts {
            return RestartDecision::GiveUp { restarts: spent };
        }
        self.history.push_back(now);
        RestartDecision::Restart {
            attempt: spent + 1,
            delay: self.backoff(spent),
        }
    }

    /// `initial * 2^n`, capped at the policy maximum.
    fn backoff(&self, prior_restarts: u32) -> Duration {
        let factor = 1u32.checked_shl(prior_restarts).unwrap_or(u32::MAX);
        self.policy
            .initial_backoff
            .checked_mul(factor)
            .map_or(self.policy.max_backoff, |delay| {
                delay.min(self.policy.max_backoff)
            })
    }
}

//! Reconnection policy: bounded retries with a linear delay after an involuntary disconnect.
//!
//! Attempt `n` (1-indexed) waits `n * base_delay`. After `max_attempts` failed attempts the
//! policy is exhausted and schedules nothing further until a connection succeeds again.

use crate::error::LifecycleError;
use std::time::Duration;

/// Where the policy is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    Idle,
    Scheduled { attempt: u32 },
    Attempting { attempt: u32 },
    Exhausted,
}

/// What to do after a loss or a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp(LifecycleError),
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_attempts: u32,
    attempt: u32,
    phase: ReconnectPhase,
}

impl ReconnectPolicy {
    /// `max_attempts == 0` gives up immediately on every loss.
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            attempt: 0,
            phase: ReconnectPhase::Idle,
        }
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.phase
    }

    /// Attempts made since the last successful connection.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Delay before the next attempt, or None once exhausted.
    pub fn next_delay(&self) -> Option<Duration> {
        (self.attempt < self.max_attempts).then(|| self.delay_for(self.attempt + 1))
    }

    /// The connection dropped without being asked to.
    pub fn on_connection_lost(&mut self) -> ReconnectDecision {
        self.schedule_next()
    }

    /// A scheduled attempt is due. Returns its number, or None if nothing was scheduled.
    pub fn begin_attempt(&mut self) -> Option<u32> {
        match self.phase {
            ReconnectPhase::Scheduled { attempt } => {
                self.phase = ReconnectPhase::Attempting { attempt };
                Some(attempt)
            }
            _ => None,
        }
    }

    pub fn on_attempt_failed(&mut self) -> ReconnectDecision {
        self.schedule_next()
    }

    pub fn on_connected(&mut self) {
        self.attempt = 0;
        self.phase = ReconnectPhase::Idle;
    }

    /// Drop any scheduled attempt (deliberate disconnect or manual connect).
    pub fn cancel(&mut self) {
        self.phase = ReconnectPhase::Idle;
    }

    fn schedule_next(&mut self) -> ReconnectDecision {
        if self.attempt >= self.max_attempts {
            self.phase = ReconnectPhase::Exhausted;
            return ReconnectDecision::GiveUp(LifecycleError::MaxReconnectAttemptsReached {
                attempts: self.attempt,
            });
        }
        self.attempt += 1;
        self.phase = ReconnectPhase::Scheduled {
            attempt: self.attempt,
        };
        ReconnectDecision::Retry {
            attempt: self.attempt,
            delay: self.delay_for(self.attempt),
        }
    }
}

//! Convergence polling over eventually-consistent cluster state.
//!
//! A predicate is evaluated serially on the calling thread, with a blocking
//! sleep between evaluations. Two schedules exist and both are kept on
//! purpose:
//!
//! - [`PollMode::Immediate`] checks right away, for state that may already
//!   hold (e.g. "at least N pods exist").
//! - [`PollMode::Delayed`] sleeps one interval first, for cheap predicates
//!   over state known not to converge instantly (e.g. a log line count).
//!
//! The deadline never interrupts a running evaluation; it only stops new ones
//! from being scheduled.

use std::fmt::Debug;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::errors::{HarnessError, HarnessResult};

/// Floor applied to the polling interval so a zero interval cannot spin.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of one predicate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation<T> {
    /// The awaited condition holds; polling stops with this value.
    Converged(T),
    /// Not yet. The value is kept for timeout diagnostics.
    Pending(T),
    /// The condition can never hold; polling stops at once.
    Failed(String),
}

impl<T> Observation<T> {
    /// `Converged(value)` if `done`, otherwise `Pending(value)`.
    pub fn from_bool(done: bool, value: T) -> Self {
        if done {
            Self::Converged(value)
        } else {
            Self::Pending(value)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Evaluate first, then sleep between evaluations.
    Immediate,
    /// Sleep one interval before the first evaluation.
    Delayed,
}

/// Serial, single-flight poller.
#[derive(Debug, Clone)]
pub struct Poller {
    description: String,
    interval: Duration,
    timeout: Duration,
    mode: PollMode,
}

impl Poller {
    /// Poller with [`PollMode::Immediate`] scheduling.
    pub fn new(description: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
        Self {
            description: description.into(),
            interval: interval.max(MIN_POLL_INTERVAL),
            timeout,
            mode: PollMode::Immediate,
        }
    }

    pub fn with_mode(mut self, mode: PollMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn delayed(self) -> Self {
        self.with_mode(PollMode::Delayed)
    }

    pub fn mode(&self) -> PollMode {
        self.mode
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Evaluate `predicate` until it converges, fails hard, or time runs out.
    pub fn run<T, F>(&self, mut predicate: F) -> HarnessResult<T>
    where
        T: Debug,
        F: FnMut() -> Observation<T>,
    {
        debug!(
            description = %self.description,
            interval_ms = self.interval.as_millis() as u64,
            timeout_ms = self.timeout.as_millis() as u64,
            mode = ?self.mode,
            "Polling for convergence"
        );

        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut attempts = 0u32;

        if self.mode == PollMode::Delayed {
            thread::sleep(self.interval.min(self.timeout));
        }

        loop {
            attempts += 1;
            let last_observed = match predicate() {
                Observation::Converged(value) => {
                    debug!(
                        description = %self.description,
                        attempts,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Condition converged"
                    );
                    return Ok(value);
                }
                Observation::Failed(reason) => {
                    warn!(
                        description = %self.description,
                        attempts,
                        %reason,
                        "Condition can never hold"
                    );
                    return Err(HarnessError::HardPredicateFailure {
                        description: self.description.clone(),
                        reason,
                    });
                }
                Observation::Pending(value) => format!("{value:?}"),
            };

            let now = Instant::now();
            if now >= deadline {
                let elapsed = now.duration_since(start);
                warn!(
                    description = %self.description,
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Timed out waiting for convergence"
                );
                return Err(HarnessError::ConvergenceTimeout {
                    description: self.description.clone(),
                    elapsed,
                    attempts,
                    last_observed: Some(last_observed),
                });
            }
            thread::sleep(self.interval.min(deadline - now));
        }
    }
}

/// Poll with an immediate first evaluation.
pub fn poll_until_immediate<T, F>(
    description: &str,
    interval: Duration,
    timeout: Duration,
    predicate: F,
) -> HarnessResult<T>
where
    T: Debug,
    F: FnMut() -> Observation<T>,
{
    Poller::new(description, interval, timeout).run(predicate)
}

/// Poll, sleeping one interval before the first evaluation.
pub fn poll_until<T, F>(
    description: &str,
    interval: Duration,
    timeout: Duration,
    predicate: F,
) -> HarnessResult<T>
where
    T: Debug,
    F: FnMut() -> Observation<T>,
{
    Poller::new(description, interval, timeout)
        .delayed()
        .run(predicate)
}

//! Bounded retry for one named class of transient conflict.
//!
//! The cluster reports optimistic-concurrency conflicts only as text, so a
//! failure is classified by substring match against its rendered message.
//! Anything that does not match is returned on the spot, and a matching
//! failure that survives every attempt is returned exactly as the operation
//! produced it.

use std::fmt::Display;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Message the server attaches to optimistic-lock conflicts.
pub const OPTIMISTIC_LOCK_ERROR_MSG: &str =
    "the object has been modified; please apply your changes to the latest version and try again";

/// Textual marker identifying a retry-safe failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictSignature(String);

impl ConflictSignature {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// Signature of the server's optimistic-lock conflict.
    pub fn optimistic_lock() -> Self {
        Self::new(OPTIMISTIC_LOCK_ERROR_MSG)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Substring test against a failure description.
    ///
    /// An empty signature matches nothing; it must never turn into a
    /// catch-all retry.
    pub fn matches(&self, message: &str) -> bool {
        !self.0.is_empty() && message.contains(&self.0)
    }
}

impl Default for ConflictSignature {
    fn default() -> Self {
        Self::optimistic_lock()
    }
}

/// Retry policy for conflict-prone client operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRetryPolicy {
    pub signature: ConflictSignature,
    /// Maximum attempts including the first try (minimum 1).
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub backoff: Duration,
}

impl Default for ConflictRetryPolicy {
    fn default() -> Self {
        Self {
            signature: ConflictSignature::optimistic_lock(),
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl ConflictRetryPolicy {
    pub fn new(signature: ConflictSignature) -> Self {
        Self {
            signature,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Run `op`, retrying only failures whose message carries the signature.
    pub fn execute<T, E, F>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Display,
    {
        let max_attempts = self.attempts();
        let mut attempt = 1;

        loop {
            debug!(attempt, max_attempts, "Starting conflict-guarded attempt");

            match op() {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, "Operation succeeded after conflict retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let message = err.to_string();
                    if !self.signature.matches(&message) {
                        warn!(attempt, error = %message, "Operation failed (not a conflict)");
                        return Err(err);
                    }
                    if attempt >= max_attempts {
                        warn!(attempt, "Conflict persisted through every attempt");
                        return Err(err);
                    }
                    warn!(
                        attempt,
                        backoff_ms = self.backoff.as_millis() as u64,
                        "Operation hit a transient conflict, retrying"
                    );
                    thread::sleep(self.backoff);
                    attempt += 1;
                }
            }
        }
    }
}

/// Functional form of [`ConflictRetryPolicy::execute`].
pub fn execute_with_conflict_retry<T, E, F>(
    op: F,
    signature: &ConflictSignature,
    max_attempts: u32,
    backoff: Duration,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: Display,
{
    ConflictRetryPolicy {
        signature: signature.clone(),
        max_attempts,
        backoff,
    }
    .execute(op)
}

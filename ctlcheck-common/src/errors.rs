//! Error taxonomy shared by every verification primitive.
//!
//! Each variant is a final verdict handed back to the scenario that invoked
//! the primitive. Nothing in this crate swallows one of these; the only
//! failures that are retried are conflict-signature matches, and those keep
//! the operation's own error type (see [`crate::retry`]).

use std::time::Duration;

/// Error type for harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The awaited condition did not hold before the deadline.
    #[error(
        "timed out after {elapsed:?} ({attempts} attempts) waiting for {description}; last observed: {}",
        last_observed.as_deref().unwrap_or("<nothing observed>")
    )]
    ConvergenceTimeout {
        description: String,
        elapsed: Duration,
        attempts: u32,
        last_observed: Option<String>,
    },

    /// The predicate decided the awaited condition can never hold.
    #[error("gave up waiting for {description}: {reason}")]
    HardPredicateFailure { description: String, reason: String },

    /// An expected anchor or token is absent from captured output.
    #[error("failed to find {missing:?} in {context:?}")]
    VerificationMismatch { missing: String, context: String },

    /// The client exited non-zero. Stderr is carried verbatim.
    #[error("error running {command}: exit status {exit_code}\nstderr:\n{stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("process failed to start: {0}")]
    ProcessStartFailed(String),

    #[error("process timed out after {0:?}")]
    Timeout(Duration),

    /// Pipe creation, listener bind, missing binary and similar.
    #[error("setup failed: {0}")]
    Setup(String),

    #[error("streaming upload failed: {0}")]
    UploadFailed(String),

    #[error("http request failed: {0}")]
    Http(String),

    #[error("failed to parse {what}: {detail}")]
    Parse { what: String, detail: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

impl HarnessError {
    /// Whether this is a setup failure that must abort the scenario outright.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            Self::Setup(_) | Self::ProcessStartFailed(_) | Self::Io(_) | Self::Config(_)
        )
    }
}

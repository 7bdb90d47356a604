//! Black-box verification primitives for driving a cluster CLI client.
//!
//! The client under test is launched as a subprocess and observed only
//! through its output, exit status and network traffic. This crate provides
//! the pieces a verification scenario is assembled from:
//!
//! - [`retry`]: bounded retry of operations that hit optimistic-lock conflicts
//! - [`poll`]: waiting for eventually-consistent state to converge
//! - [`verify`]: ordered multi-token matching of human-readable output
//! - [`interactive`] and [`upload`]: live stdin pipes and streaming uploads
//! - [`proxy`]: a logging forward proxy for proxy-variable checks
//! - [`exec`], [`http`], [`state`]: running the client and observing the cluster
//!
//! Every harness takes its settings from an explicit [`HarnessConfig`].

pub mod config;
pub mod errors;
pub mod exec;
pub mod http;
pub mod interactive;
pub mod poll;
pub mod proxy;
pub mod retry;
pub mod state;
pub mod testing;
pub mod upload;
pub mod util;
pub mod verify;

pub use config::HarnessConfig;
pub use errors::{HarnessError, HarnessResult};
pub use exec::{ClientCommand, ClientProxy, CommandResult, ProxyBinding, find_binary};
pub use interactive::{BlockingInput, InteractiveSession, blocking_input, run_interactive};
pub use poll::{Observation, PollMode, Poller, poll_until, poll_until_immediate};
pub use proxy::{ProxyHarness, ProxyLog, ProxyVar, expected_connect_line};
pub use retry::{
    ConflictRetryPolicy, ConflictSignature, OPTIMISTIC_LOCK_ERROR_MSG, execute_with_conflict_retry,
};
pub use state::{ClientStateQuery, ResourceState, StateQuery};
pub use upload::{StreamingUpload, channel_pipe};
pub use verify::{RequirementGroup, check_output};

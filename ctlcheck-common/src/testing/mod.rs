//! Test support: structured logging for harness tests and verification scenarios.

mod log;

pub use log::{ScenarioLogEntry, ScenarioLogger, ScenarioPhase, init_test_logging};

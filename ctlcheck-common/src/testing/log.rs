//! Structured test logging for CI debugging.
//!
//! Tests call [`init_test_logging`] once (usually from a `#[ctor::ctor]`
//! hook) to route every `tracing` event from the harness into
//! `target/test-logs/all_tests.jsonl` as well as the test output.
//!
//! ```ignore
//! #[ctor::ctor]
//! fn setup() {
//!     ctlcheck_common::testing::init_test_logging();
//! }
//! ```
//!
//! A [`ScenarioLogger`] additionally writes one JSONL file per scenario with
//! its phases, the client commands it ran and their results.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use std::time::{Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

use crate::exec::CommandResult;
use crate::util::lock;

/// Env var overriding the aggregated log path.
const LOG_FILE_ENV: &str = "CTLCHECK_TEST_LOG_FILE";
/// Env var with the level for harness crates (default `info`).
const LOG_LEVEL_ENV: &str = "CTLCHECK_TEST_LOG_LEVEL";

static GLOBAL_LOGGING_INIT: Once = Once::new();

/// Initialize global JSONL logging for all tests.
///
/// Writes JSON events to `target/test-logs/all_tests.jsonl` (or
/// `CTLCHECK_TEST_LOG_FILE`) and compact lines to the test writer. Safe to
/// call more than once.
pub fn init_test_logging() {
    GLOBAL_LOGGING_INIT.call_once(|| {
        let file_layer = create_global_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        });

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .with_level(true)
            .compact();

        let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "ctlcheck_common={level},ctlcheck={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn create_global_log_file() -> Option<std::fs::File> {
    if let Ok(custom_path) = std::env::var(LOG_FILE_ENV) {
        if let Some(parent) = PathBuf::from(&custom_path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return std::fs::File::create(&custom_path).ok();
    }

    let log_dir = find_target_dir().join("test-logs");
    let _ = std::fs::create_dir_all(&log_dir);
    std::fs::File::create(log_dir.join("all_tests.jsonl")).ok()
}

/// Find the target directory by searching up from current dir.
fn find_target_dir() -> PathBuf {
    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(target_dir);
    }

    let mut cwd = std::env::current_dir().unwrap_or_default();
    loop {
        let target = cwd.join("target");
        if target.is_dir() {
            return target;
        }
        if !cwd.pop() {
            return PathBuf::from("target");
        }
    }
}

/// Scenario execution phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioPhase {
    Setup,
    Execute,
    Verify,
    Teardown,
}

impl std::fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Execute => write!(f, "execute"),
            Self::Verify => write!(f, "verify"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

/// One line of a scenario log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioLogEntry {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    pub scenario: String,
    pub phase: ScenarioPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Milliseconds since the scenario started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ScenarioLogEntry {
    pub fn new(scenario: &str, phase: ScenarioPhase, message: impl Into<String>) -> Self {
        Self {
            timestamp: humantime::format_rfc3339_millis(SystemTime::now()).to_string(),
            scenario: scenario.to_string(),
            phase,
            message: message.into(),
            data: None,
            duration_ms: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Per-scenario JSONL logger writing to `target/test-logs/<scenario>.jsonl`.
pub struct ScenarioLogger {
    scenario: String,
    start_time: Instant,
    entries: Mutex<Vec<ScenarioLogEntry>>,
    log_file: Option<Mutex<std::fs::File>>,
}

impl ScenarioLogger {
    pub fn for_scenario(scenario: &str) -> Self {
        let log_file = Self::create_log_file(scenario).ok();
        let logger = Self {
            scenario: scenario.to_string(),
            start_time: Instant::now(),
            entries: Mutex::new(Vec::new()),
            log_file: log_file.map(Mutex::new),
        };
        logger.log(ScenarioPhase::Setup, "SCENARIO START");
        logger
    }

    fn create_log_file(scenario: &str) -> std::io::Result<std::fs::File> {
        let log_dir = find_target_dir().join("test-logs");
        std::fs::create_dir_all(&log_dir)?;
        let safe_name = scenario
            .replace("::", "_")
            .replace(['/', '\\', ' '], "_");
        std::fs::File::create(log_dir.join(format!("{safe_name}.jsonl")))
    }

    pub fn log(&self, phase: ScenarioPhase, message: impl Into<String>) {
        let entry = ScenarioLogEntry::new(&self.scenario, phase, message)
            .with_duration(self.elapsed_ms());
        self.write_entry(entry);
    }

    pub fn log_with_data(
        &self,
        phase: ScenarioPhase,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        let entry = ScenarioLogEntry::new(&self.scenario, phase, message)
            .with_duration(self.elapsed_ms())
            .with_data(data);
        self.write_entry(entry);
    }

    /// Record a finished client command with its exit status and output.
    pub fn log_command(&self, command_line: &str, result: &CommandResult) {
        self.log_with_data(
            ScenarioPhase::Execute,
            format!("ran {command_line}"),
            serde_json::json!({
                "exit_code": result.exit_code,
                "timed_out": result.timed_out,
                "duration_ms": result.duration.as_millis() as u64,
                "stdout": result.stdout,
                "stderr": result.stderr,
            }),
        );
    }

    fn write_entry(&self, entry: ScenarioLogEntry) {
        if let Some(file) = &self.log_file
            && let Ok(json) = serde_json::to_string(&entry)
        {
            let _ = writeln!(lock(file), "{json}");
        }

        tracing::info!(
            scenario = %self.scenario,
            phase = %entry.phase,
            duration_ms = entry.duration_ms,
            "{}",
            entry.message
        );
        lock(&self.entries).push(entry);
    }

    pub fn entries(&self) -> Vec<ScenarioLogEntry> {
        lock(&self.entries).clone()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn pass(self) {
        self.log(ScenarioPhase::Verify, "SCENARIO PASS");
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.log_with_data(
            ScenarioPhase::Verify,
            "SCENARIO FAIL",
            serde_json::json!({ "reason": reason.into() }),
        );
    }
}

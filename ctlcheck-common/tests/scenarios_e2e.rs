//! End-to-end scenarios composing the harness primitives against a scripted
//! stand-in for the client binary.
//!
//! The fake client is a POSIX shell script that understands just enough of
//! the real client's argument shapes (`scale`, `get`, `describe`, `attach`,
//! `version`) to drive each primitive through a realistic path.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ctlcheck_common::testing::{ScenarioLogger, ScenarioPhase, init_test_logging};
use ctlcheck_common::{
    ClientCommand, ConflictRetryPolicy, HarnessConfig, HarnessError, Observation, ProxyHarness,
    ProxyVar, RequirementGroup, check_output, expected_connect_line, poll_until,
    poll_until_immediate, run_interactive,
};

#[ctor::ctor]
fn setup() {
    init_test_logging();
}

const FAKE_CLIENT: &str = r#"#!/bin/sh
# Flags may precede the verb; skip them.
while [ $# -gt 0 ]; do
  case "$1" in
    --*) shift ;;
    *) break ;;
  esac
done
state="$FAKE_STATE_DIR"
verb="$1"; shift
case "$verb" in
  scale)
    n=$(cat "$state/scale-attempts" 2>/dev/null || echo 0)
    n=$((n+1)); echo $n > "$state/scale-attempts"
    if [ $n -lt 3 ]; then
      echo 'Error from server (Conflict): Operation cannot be fulfilled on replicationcontrollers "redis-master": the object has been modified; please apply your changes to the latest version and try again' >&2
      exit 1
    fi
    echo "$1 scaled"
    ;;
  get)
    n=$(cat "$state/get-calls" 2>/dev/null || echo 0)
    n=$((n+1)); echo $n > "$state/get-calls"
    if [ $n -ge 3 ]; then echo 2; else echo 1; fi
    ;;
  describe)
    printf 'Name:\t\tredis-master\nNamespace:\te2e-tests\nSelector:\tapp=redis,role=master\nReplicas:\t1 current / 1 desired\nPods Status:\t1 Running / 0 Waiting / 0 Succeeded / 0 Failed\nEvents:\n  Reason\tMessage\n  SuccessfulCreate\tCreated pod: redis-master-x1\n'
    ;;
  attach)
    read line
    echo "attached: $line"
    ;;
  version)
    printf '%s' "${https_proxy:-$HTTPS_PROXY}"
    ;;
  *)
    echo "error: unknown command \"$verb\"" >&2
    exit 1
    ;;
esac
"#;

struct FakeClient {
    _dir: tempfile::TempDir,
    config: HarnessConfig,
    state_dir: PathBuf,
}

impl FakeClient {
    fn install() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("client");
        fs::write(&binary, FAKE_CLIENT).unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
        let state_dir = dir.path().join("state");
        fs::create_dir_all(&state_dir).unwrap();

        let config = HarnessConfig::default()
            .with_client_binary(&binary)
            .with_namespace("e2e-tests")
            .with_default_timeout(Duration::from_secs(10))
            .with_env("FAKE_STATE_DIR", state_dir.to_string_lossy());
        Self {
            _dir: dir,
            config,
            state_dir,
        }
    }

    fn command<const N: usize>(&self, args: [&str; N]) -> ClientCommand {
        ClientCommand::new(&self.config, args)
    }

    fn counter(&self, name: &str) -> u32 {
        read_counter(&self.state_dir.join(name))
    }
}

fn read_counter(path: &Path) -> u32 {
    fs::read_to_string(path)
        .map(|s| s.trim().parse().unwrap_or(0))
        .unwrap_or(0)
}

#[test]
fn scale_survives_optimistic_lock_conflicts() {
    let logger = ScenarioLogger::for_scenario("scale_survives_optimistic_lock_conflicts");
    let client = FakeClient::install();

    let out = client
        .command(["scale", "rc", "redis-master", "--replicas=2"])
        .retry_policy(ConflictRetryPolicy::default().with_backoff(Duration::from_millis(10)))
        .exec_with_conflict_retry()
        .unwrap();

    assert_eq!(out, "rc scaled\n");
    assert_eq!(client.counter("scale-attempts"), 3);
    logger.pass();
}

#[test]
fn exhausted_conflict_surfaces_client_stderr() {
    let client = FakeClient::install();
    let err = client
        .command(["scale", "rc", "redis-master", "--replicas=2"])
        .retry_policy(
            ConflictRetryPolicy::default()
                .with_max_attempts(2)
                .with_backoff(Duration::from_millis(1)),
        )
        .exec_with_conflict_retry()
        .unwrap_err();

    match err {
        HarnessError::CommandFailed { stderr, .. } => {
            assert!(stderr.contains("the object has been modified"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(client.counter("scale-attempts"), 2);
}

#[test]
fn replica_count_converges_in_both_poll_modes() {
    for delayed in [false, true] {
        let client = FakeClient::install();
        let observe = || {
            let out = client
                .command(["get", "rc", "redis-master", "-o", "template"])
                .exec_ok();
            match out {
                Ok(out) => {
                    let replicas: u32 = out.trim().parse().unwrap_or(0);
                    Observation::from_bool(replicas == 2, replicas)
                }
                Err(err) => Observation::Failed(err.to_string()),
            }
        };

        let replicas = if delayed {
            poll_until(
                "two replicas",
                Duration::from_millis(20),
                Duration::from_secs(10),
                observe,
            )
        } else {
            poll_until_immediate(
                "two replicas",
                Duration::from_millis(20),
                Duration::from_secs(10),
                observe,
            )
        }
        .unwrap();

        assert_eq!(replicas, 2);
        assert_eq!(client.counter("get-calls"), 3);
    }
}

#[test]
fn unknown_command_fails_the_poll_immediately() {
    let client = FakeClient::install();
    let err = poll_until_immediate(
        "bogus resource",
        Duration::from_millis(10),
        Duration::from_secs(10),
        || match client.command(["frobnicate"]).exec_ok() {
            Ok(out) => Observation::Converged(out),
            Err(err) => Observation::Failed(err.to_string()),
        },
    )
    .unwrap_err();
    match err {
        HarnessError::HardPredicateFailure { reason, .. } => {
            assert!(reason.contains("unknown command"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn describe_output_sections_appear_in_order() {
    let logger = ScenarioLogger::for_scenario("describe_output_sections_appear_in_order");
    let client = FakeClient::install();
    let out = client.command(["describe", "rc", "redis-master"]).exec_ok().unwrap();
    logger.log(ScenarioPhase::Verify, "checking describe layout");

    let required: Vec<RequirementGroup> = [
        "Name:,redis-master",
        "Namespace:,e2e-tests",
        "Selector:,app=redis,role=master",
        "Replicas:,1 current,1 desired",
        "Pods Status:,1 Running,0 Waiting,0 Succeeded,0 Failed",
        "Events:",
        "SuccessfulCreate,Created pod",
    ]
    .iter()
    .map(|g| RequirementGroup::parse(g))
    .collect();
    check_output(&out, &required).unwrap();

    // Events come after Replicas; asking for them the other way round fails.
    let reversed = vec![vec!["Events:"], vec!["Replicas:"]];
    assert!(check_output(&out, &reversed).is_err());
    logger.pass();
}

#[test]
fn attach_reads_interactive_input_without_eof() {
    let client = FakeClient::install();
    let result = run_interactive(
        client.command(["attach", "redis-master", "-i"]),
        b"abcd1234\n",
        Duration::from_secs(10),
    )
    .unwrap();
    assert!(result.success(), "stderr: {}", result.stderr);
    assert_eq!(result.stdout, "attached: abcd1234\n");
}

/// Stand in for the client's HTTPS dial: CONNECT through `proxy` to `server`.
fn connect_via(proxy: &str, server: &str) -> String {
    let proxy_addr = proxy.trim_start_matches("http://");
    let target = server.trim_start_matches("https://").trim_end_matches("/api");
    let target = if target.contains(':') {
        target.to_string()
    } else {
        format!("{target}:443")
    };

    let mut stream = TcpStream::connect(proxy_addr).unwrap();
    write!(stream, "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").unwrap();
    let mut status = String::new();
    BufReader::new(stream).read_line(&mut status).unwrap();
    status
}

#[test]
fn client_traverses_proxy_for_each_variable_spelling() {
    let server = "https://10.0.0.1/api";
    for var in ProxyVar::ALL {
        let logger = ScenarioLogger::for_scenario(&format!("proxy traversal via {var}"));
        let client = FakeClient::install();
        let proxy = ProxyHarness::start().unwrap();
        let (key, value) = var.env_pair(&proxy.endpoint());

        let seen = client
            .command(["version"])
            .without_namespace()
            .env(key, value)
            .exec_ok()
            .unwrap();
        assert_eq!(seen, proxy.endpoint());

        let status = connect_via(&seen, server);
        assert!(status.starts_with("HTTP/1.1 200"), "status: {status}");

        let expected = expected_connect_line(server);
        proxy.log().wait_for(&expected, Duration::from_secs(5)).unwrap();
        logger.log_with_data(
            ScenarioPhase::Verify,
            "proxy log",
            serde_json::json!({ "lines": proxy.log().lines() }),
        );
        proxy.stop();
        logger.pass();
    }
}

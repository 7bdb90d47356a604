//! Read-only view of cluster objects for convergence predicates.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::exec::ClientCommand;
use crate::poll::{Observation, Poller};

/// Snapshot of one object as seen by the client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceState {
    pub exists: bool,
    pub ready: bool,
    pub phase: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// `subsets[].ports[].port` for endpoints objects.
    pub endpoint_ports: Vec<u16>,
    /// `subsets[].addresses[].ip` for endpoints objects.
    pub endpoint_addresses: Vec<String>,
    pub raw: Value,
}

impl ResourceState {
    pub fn absent() -> Self {
        Self::default()
    }

    /// Interpret a single object in the client's JSON output.
    pub fn from_json(value: Value) -> Self {
        let string_map = |pointer: &str| -> BTreeMap<String, String> {
            value
                .pointer(pointer)
                .and_then(Value::as_object)
                .map(|map| {
                    map.iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                        .collect()
                })
                .unwrap_or_default()
        };

        let phase = value
            .pointer("/status/phase")
            .and_then(Value::as_str)
            .map(str::to_string);
        let ready_condition = value
            .pointer("/status/conditions")
            .and_then(Value::as_array)
            .is_some_and(|conditions| {
                conditions.iter().any(|c| {
                    c.get("type").and_then(Value::as_str) == Some("Ready")
                        && c.get("status").and_then(Value::as_str) == Some("True")
                })
            });

        let subsets = value
            .get("subsets")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut endpoint_ports = Vec::new();
        let mut endpoint_addresses = Vec::new();
        for subset in &subsets {
            for port in subset.get("ports").and_then(Value::as_array).into_iter().flatten() {
                if let Some(port) = port
                    .get("port")
                    .and_then(Value::as_u64)
                    .and_then(|p| u16::try_from(p).ok())
                {
                    endpoint_ports.push(port);
                }
            }
            for address in subset
                .get("addresses")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if let Some(ip) = address.get("ip").and_then(Value::as_str) {
                    endpoint_addresses.push(ip.to_string());
                }
            }
        }
        endpoint_ports.sort_unstable();

        Self {
            exists: true,
            ready: ready_condition || phase.as_deref() == Some("Running"),
            phase,
            annotations: string_map("/metadata/annotations"),
            labels: string_map("/metadata/labels"),
            endpoint_ports,
            endpoint_addresses,
            raw: value,
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Synchronous lookup of an object's current state.
pub trait StateQuery {
    fn query(&self, kind: &str, name: &str, namespace: &str) -> HarnessResult<ResourceState>;
}

/// [`StateQuery`] backed by `<client> get <kind> <name> -o json`.
#[derive(Debug, Clone)]
pub struct ClientStateQuery {
    config: HarnessConfig,
}

impl ClientStateQuery {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }
}

impl StateQuery for ClientStateQuery {
    fn query(&self, kind: &str, name: &str, namespace: &str) -> HarnessResult<ResourceState> {
        let result = ClientCommand::new(&self.config, ["get", kind, name, "-o", "json"])
            .namespace(namespace)
            .exec()?;

        if !result.success() {
            if is_not_found(&result.stderr) {
                debug!(kind, name, namespace, "Object not found");
                return Ok(ResourceState::absent());
            }
            if result.timed_out {
                return Err(HarnessError::Timeout(self.config.default_timeout));
            }
            return Err(HarnessError::CommandFailed {
                command: format!("get {kind} {name} --namespace={namespace}"),
                exit_code: result.exit_code,
                stderr: result.stderr,
            });
        }

        let value: Value = serde_json::from_str(&result.stdout).map_err(|e| HarnessError::Parse {
            what: format!("{kind}/{name}"),
            detail: e.to_string(),
        })?;
        Ok(ResourceState::from_json(value))
    }
}

/// Only the server's verdict counts. Client-side lookups such as a missing
/// context or kubeconfig also say "not found" but are real failures.
fn is_not_found(stderr: &str) -> bool {
    stderr.contains("Error from server (NotFound)")
}

/// Poll `query` until `done` holds for the object, returning that state.
///
/// Query errors count as "not yet"; the last one is reported on timeout.
pub fn wait_for_state<Q, F>(
    query: &Q,
    kind: &str,
    name: &str,
    namespace: &str,
    poller: &Poller,
    mut done: F,
) -> HarnessResult<ResourceState>
where
    Q: StateQuery + ?Sized,
    F: FnMut(&ResourceState) -> bool,
{
    let mut last = None;
    poller.run(|| match query.query(kind, name, namespace) {
        Ok(state) => {
            let summary = describe(&state);
            let converged = done(&state);
            last = Some(state);
            Observation::from_bool(converged, summary)
        }
        Err(err) => Observation::Pending(err.to_string()),
    })?;
    last.ok_or_else(|| HarnessError::Setup(format!("no state recorded for {kind}/{name}")))
}

/// Wait until the object exists and reports ready.
pub fn wait_until_ready<Q: StateQuery + ?Sized>(
    query: &Q,
    kind: &str,
    name: &str,
    namespace: &str,
    interval: Duration,
    timeout: Duration,
) -> HarnessResult<ResourceState> {
    let poller = Poller::new(format!("{kind}/{name} to be ready"), interval, timeout);
    wait_for_state(query, kind, name, namespace, &poller, |state| {
        state.exists && state.ready
    })
}

/// Wait until the object no longer exists.
pub fn wait_until_gone<Q: StateQuery + ?Sized>(
    query: &Q,
    kind: &str,
    name: &str,
    namespace: &str,
    interval: Duration,
    timeout: Duration,
) -> HarnessResult<()> {
    let poller = Poller::new(format!("{kind}/{name} to be deleted"), interval, timeout);
    wait_for_state(query, kind, name, namespace, &poller, |state| !state.exists)?;
    Ok(())
}

/// Wait until an endpoints object exposes exactly `expected` ports.
pub fn wait_for_endpoint_ports<Q: StateQuery + ?Sized>(
    query: &Q,
    service: &str,
    namespace: &str,
    expected: &[u16],
    interval: Duration,
    timeout: Duration,
) -> HarnessResult<ResourceState> {
    let mut expected = expected.to_vec();
    expected.sort_unstable();
    let poller = Poller::new(
        format!("endpoints/{service} to expose ports {expected:?}"),
        interval,
        timeout,
    );
    wait_for_state(query, "endpoints", service, namespace, &poller, |state| {
        state.endpoint_ports == expected
    })
}

fn describe(state: &ResourceState) -> String {
    if !state.exists {
        return "absent".to_string();
    }
    let mut summary = format!(
        "exists, ready={}, phase={}",
        state.ready,
        state.phase.as_deref().unwrap_or("<none>")
    );
    if !state.endpoint_ports.is_empty() {
        summary.push_str(&format!(", ports={:?}", state.endpoint_ports));
    }
    summary
}

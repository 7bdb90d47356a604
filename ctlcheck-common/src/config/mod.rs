//! Harness configuration.
//!
//! A [`HarnessConfig`] is built once per test run and passed explicitly to
//! every harness constructor. Layers, lowest precedence first: built-in
//! defaults, an optional TOML file, then `CTLCHECK_*` environment variables.

pub mod env;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::errors::{HarnessError, HarnessResult};
use crate::exec::find_binary;
use crate::retry::ConflictRetryPolicy;

pub use env::{EnvError, EnvParser, parse_duration};

/// Name of the client binary looked up on `PATH` when nothing else is set.
pub const DEFAULT_CLIENT_BINARY: &str = "kubectl";

/// Environment variable naming a TOML config file for [`HarnessConfig::load_default`].
pub const CONFIG_FILE_ENV: &str = "CTLCHECK_CONFIG";

/// Configuration for the verification harness
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    /// Client under test. `None` means [`DEFAULT_CLIENT_BINARY`] on `PATH`.
    pub client_binary: Option<PathBuf>,
    /// Source tree searched by [`find_binary`] when no binary is given.
    pub repo_root: Option<PathBuf>,
    /// `<os>/<arch>` used for binary discovery, e.g. `linux/amd64`.
    pub platform: String,
    /// API server URL passed as `--server`.
    pub host: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    /// Namespace applied to commands that don't set their own.
    pub namespace: Option<String>,
    /// Default timeout for client commands
    pub default_timeout: Duration,
    /// Default interval for convergence polling
    pub poll_interval: Duration,
    pub conflict_retry: ConflictRetryPolicy,
    /// Environment variables to set for every client process
    pub env_vars: BTreeMap<String, String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            client_binary: None,
            repo_root: None,
            platform: host_platform(),
            host: None,
            kubeconfig: None,
            namespace: None,
            default_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            conflict_retry: ConflictRetryPolicy::default(),
            env_vars: BTreeMap::new(),
        }
    }
}

/// On-disk form; every field optional, durations as humantime strings.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    client_binary: Option<PathBuf>,
    repo_root: Option<PathBuf>,
    platform: Option<String>,
    host: Option<String>,
    kubeconfig: Option<PathBuf>,
    namespace: Option<String>,
    timeout: Option<String>,
    poll_interval: Option<String>,
    conflict_retry: Option<ConflictRetryFile>,
    env: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConflictRetryFile {
    attempts: Option<u32>,
    backoff: Option<String>,
}

impl HarnessConfig {
    /// Defaults overlaid with `CTLCHECK_*` variables.
    pub fn from_env() -> HarnessResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.discover_client_binary();
        Ok(config)
    }

    /// Defaults, then `path` (if any), then the environment.
    pub fn load(path: Option<&Path>) -> HarnessResult<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                HarnessError::Config(format!("cannot read {}: {e}", path.display()))
            })?;
            config.apply_toml(&contents)?;
            debug!(path = %path.display(), "Loaded harness config file");
        }
        config.apply_env()?;
        config.discover_client_binary();
        Ok(config)
    }

    /// Like [`Self::load`] with the file named by `CTLCHECK_CONFIG`.
    pub fn load_default() -> HarnessResult<Self> {
        let path = std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from);
        Self::load(path.as_deref())
    }

    /// Overlay settings from TOML text.
    pub fn apply_toml(&mut self, contents: &str) -> HarnessResult<()> {
        let file: ConfigFile = toml::from_str(contents)
            .map_err(|e| HarnessError::Config(format!("invalid config file: {e}")))?;

        let duration = |field: &str, raw: Option<String>| -> HarnessResult<Option<Duration>> {
            raw.map(|value| {
                parse_duration(&value).ok_or_else(|| {
                    HarnessError::Config(format!("invalid duration for {field}: {value}"))
                })
            })
            .transpose()
        };

        if file.client_binary.is_some() {
            self.client_binary = file.client_binary;
        }
        if file.repo_root.is_some() {
            self.repo_root = file.repo_root;
        }
        if let Some(platform) = file.platform {
            self.platform = platform;
        }
        if file.host.is_some() {
            self.host = file.host;
        }
        if file.kubeconfig.is_some() {
            self.kubeconfig = file.kubeconfig;
        }
        if file.namespace.is_some() {
            self.namespace = file.namespace;
        }
        if let Some(timeout) = duration("timeout", file.timeout)? {
            self.default_timeout = timeout;
        }
        if let Some(interval) = duration("poll_interval", file.poll_interval)? {
            self.poll_interval = interval;
        }
        if let Some(retry) = file.conflict_retry {
            if let Some(attempts) = retry.attempts {
                self.conflict_retry.max_attempts = attempts;
            }
            if let Some(backoff) = duration("conflict_retry.backoff", retry.backoff)? {
                self.conflict_retry.backoff = backoff;
            }
        }
        self.env_vars.extend(file.env);
        Ok(())
    }

    /// Overlay `CTLCHECK_*` variables, reporting every invalid one at once.
    pub fn apply_env(&mut self) -> HarnessResult<()> {
        let mut parser = EnvParser::new();

        if let Some(path) = parser.get_optional_path("CLIENT_BIN") {
            self.client_binary = Some(path);
        }
        if let Some(path) = parser.get_optional_path("REPO_ROOT") {
            self.repo_root = Some(path);
        }
        if let Some(platform) = parser.get_optional_string("PLATFORM") {
            self.platform = platform;
        }
        if let Some(host) = parser.get_optional_string("HOST") {
            self.host = Some(host);
        }
        if let Some(path) = parser.get_optional_path("KUBECONFIG") {
            self.kubeconfig = Some(path);
        }
        if let Some(namespace) = parser.get_optional_string("NAMESPACE") {
            self.namespace = Some(namespace);
        }
        if let Some(timeout) = parser.get_optional_duration("TIMEOUT") {
            self.default_timeout = timeout;
        }
        if let Some(interval) = parser.get_optional_duration("POLL_INTERVAL") {
            self.poll_interval = interval;
        }
        if let Some(attempts) = parser.get_optional_u32_range("CONFLICT_ATTEMPTS", 1, 100) {
            self.conflict_retry.max_attempts = attempts;
        }
        if let Some(backoff) = parser.get_optional_duration("CONFLICT_BACKOFF") {
            self.conflict_retry.backoff = backoff;
        }
        self.env_vars.extend(parser.get_key_values("ENV"));

        if parser.has_errors() {
            let messages: Vec<String> = parser
                .take_errors()
                .iter()
                .map(ToString::to_string)
                .collect();
            return Err(HarnessError::Config(messages.join("; ")));
        }
        Ok(())
    }

    /// Resolve the client from `repo_root` when no binary was configured.
    /// Falls back to `PATH` lookup if nothing was built there.
    pub fn discover_client_binary(&mut self) {
        if self.client_binary.is_some() {
            return;
        }
        let Some(root) = self.repo_root.as_deref() else {
            return;
        };
        match find_binary(root, DEFAULT_CLIENT_BINARY, &self.platform) {
            Ok(path) => {
                debug!(path = %path.display(), "Discovered client binary");
                self.client_binary = Some(path);
            }
            Err(err) => debug!(%err, "No built client found, using PATH"),
        }
    }

    /// Binary to launch for client commands.
    pub fn client_binary(&self) -> PathBuf {
        self.client_binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CLIENT_BINARY))
    }

    pub fn with_client_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_binary = Some(path.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }
}

/// `<os>/<arch>` of the running host in the client's release naming.
pub fn host_platform() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    format!("{}/{}", std::env::consts::OS, arch)
}

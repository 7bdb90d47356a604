//! Launching the client under test.
//!
//! Provides:
//! - [`ClientCommand`]: argument list, namespace, stdin source, environment
//!   overrides and timeout for one client invocation, with captured output
//! - [`ClientProxy`]: the client's own API proxy, bound to a TCP port or a
//!   Unix-domain socket path
//! - [`find_binary`]: locate the most recently built client in a source tree
//!
//! A spawned child is killed and reaped on every exit path, including
//! early returns and timeouts. Each client starts in its own process group,
//! and the kill goes to the whole group so helpers it forked die with it.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, PipeReader, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, LazyLock, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::interactive::BlockingInput;
use crate::retry::ConflictRetryPolicy;
use crate::util::{display_command, lock};

/// Exit code reported when the harness killed a command for running too long.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long to keep collecting output after the child is gone. A grandchild
/// that inherited stdout can hold the pipe open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Build output directories searched by [`find_binary`], relative to the repo root.
pub const BINARY_PREFIXES: &[&str] = &["_output/dockerized/bin", "_output/local/bin", "platforms"];

static PROXY_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Starting to serve on 127\.0\.0\.1:([0-9]+)").expect("proxy port regex is valid")
});

/// Where a client process reads its standard input from.
#[derive(Debug, Default)]
pub enum StdinSource {
    /// `/dev/null`; the client sees end-of-input at once.
    #[default]
    Null,
    /// Fixed bytes, written from a helper thread and then closed.
    Data(Vec<u8>),
    /// Read end of an OS pipe handed to the child as its real stdin. The
    /// child sees end-of-input only when every write end is closed.
    Pipe(PipeReader),
    /// Pipe read end plus the harness's write end, which is closed as soon
    /// as the child exits or is killed.
    Interactive(PipeReader, BlockingInput),
}

/// Result of a command execution
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandResult {
    /// Check if the command succeeded (exit code 0)
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn stdout_contains(&self, pattern: &str) -> bool {
        self.stdout.contains(pattern)
    }

    pub fn stderr_contains(&self, pattern: &str) -> bool {
        self.stderr.contains(pattern)
    }

    /// Get combined output (stdout + stderr)
    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// One invocation of the client binary.
#[derive(Debug)]
pub struct ClientCommand {
    binary: PathBuf,
    global_args: Vec<String>,
    args: Vec<String>,
    namespace: Option<String>,
    stdin: StdinSource,
    env: BTreeMap<String, String>,
    timeout: Duration,
    retry_policy: ConflictRetryPolicy,
}

impl ClientCommand {
    /// Command for the configured client with the config's server,
    /// kubeconfig, namespace, environment and timeout applied.
    pub fn new<I, S>(config: &HarnessConfig, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut global_args = Vec::new();
        if let Some(host) = &config.host {
            global_args.push(format!("--server={host}"));
        }
        if let Some(kubeconfig) = &config.kubeconfig {
            global_args.push(format!("--kubeconfig={}", kubeconfig.display()));
        }

        Self {
            binary: config.client_binary(),
            global_args,
            args: args.into_iter().map(Into::into).collect(),
            namespace: config.namespace.clone(),
            stdin: StdinSource::Null,
            env: config.env_vars.clone(),
            timeout: config.default_timeout,
            retry_policy: config.conflict_retry.clone(),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Drop the namespace flag, for cluster-scoped commands.
    pub fn without_namespace(mut self) -> Self {
        self.namespace = None;
        self
    }

    pub fn stdin_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = StdinSource::Data(data.into());
        self
    }

    pub fn stdin_reader(mut self, reader: PipeReader) -> Self {
        self.stdin = StdinSource::Pipe(reader);
        self
    }

    /// Give the child `reader` and hand `input` to the run, which closes it
    /// on exit or timeout.
    pub fn interactive_stdin(mut self, reader: PipeReader, input: BlockingInput) -> Self {
        self.stdin = StdinSource::Interactive(reader, input);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry_policy(mut self, policy: ConflictRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Full argument list: global flags, namespace, then the command's own
    /// arguments, so nothing lands after a `--` separator.
    pub fn full_args(&self) -> Vec<String> {
        let mut args = self.global_args.clone();
        if let Some(namespace) = &self.namespace {
            args.push(format!("--namespace={namespace}"));
        }
        args.extend(self.args.iter().cloned());
        args
    }

    pub fn command_line(&self) -> String {
        display_command(&self.binary.to_string_lossy(), &self.full_args())
    }

    /// `std::process::Command` with arguments and environment applied and
    /// stdio left to the caller. The child leads a new process group.
    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.process_group(0);
        cmd.args(self.full_args());
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }

    /// Run to completion or timeout, capturing output.
    pub fn exec(mut self) -> HarnessResult<CommandResult> {
        let stdin = std::mem::take(&mut self.stdin);
        self.run(stdin)
    }

    /// Run and return stdout, failing on a non-zero exit or timeout.
    pub fn exec_ok(mut self) -> HarnessResult<String> {
        let stdin = std::mem::take(&mut self.stdin);
        self.run_ok(stdin)
    }

    /// [`Self::exec_ok`] behind the conflict retry executor.
    ///
    /// Stdin data is replayed on each attempt; a pipe cannot be, so a
    /// command holding one is rejected up front.
    pub fn exec_with_conflict_retry(self) -> HarnessResult<String> {
        let replay = match &self.stdin {
            StdinSource::Null => None,
            StdinSource::Data(data) => Some(data.clone()),
            StdinSource::Pipe(_) | StdinSource::Interactive(..) => {
                return Err(HarnessError::Setup(
                    "piped stdin cannot be replayed across conflict retries".to_string(),
                ));
            }
        };
        self.retry_policy.execute(|| {
            let stdin = replay.clone().map_or(StdinSource::Null, StdinSource::Data);
            self.run_ok(stdin)
        })
    }

    fn run_ok(&self, stdin: StdinSource) -> HarnessResult<String> {
        let result = self.run(stdin)?;
        if result.timed_out {
            return Err(HarnessError::Timeout(self.timeout));
        }
        if !result.success() {
            return Err(HarnessError::CommandFailed {
                command: self.command_line(),
                exit_code: result.exit_code,
                stderr: result.stderr,
            });
        }
        Ok(result.stdout)
    }

    fn run(&self, stdin: StdinSource) -> HarnessResult<CommandResult> {
        let command_line = self.command_line();
        debug!(
            command = %command_line,
            timeout_ms = self.timeout.as_millis() as u64,
            "Executing client command"
        );

        let start = Instant::now();
        let mut cmd = self.to_command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut stdin_data = None;
        let mut held_input = None;
        match stdin {
            StdinSource::Null => {
                cmd.stdin(Stdio::null());
            }
            StdinSource::Data(data) => {
                cmd.stdin(Stdio::piped());
                stdin_data = Some(data);
            }
            StdinSource::Pipe(reader) => {
                cmd.stdin(Stdio::from(reader));
            }
            StdinSource::Interactive(reader, input) => {
                cmd.stdin(Stdio::from(reader));
                held_input = Some(input);
            }
        }

        let child = cmd.spawn().map_err(|e| {
            HarnessError::ProcessStartFailed(format!("{}: {e}", self.binary.display()))
        })?;
        // Release the parent's copy of any stdin pipe end.
        drop(cmd);

        let mut guard = ChildGuard::new(child);
        if let (Some(data), Some(mut pipe)) = (stdin_data, guard.child.stdin.take()) {
            // Not joined: if the child never reads, the write fails with
            // EPIPE once the child is gone.
            thread::spawn(move || {
                if let Err(err) = pipe.write_all(&data) {
                    debug!(%err, "Client closed stdin before all input was written");
                }
            });
        }
        let stdout = guard.child.stdout.take().map(OutputCapture::spawn);
        let stderr = guard.child.stderr.take().map(OutputCapture::spawn);

        let (status, timed_out) = guard.wait_timeout(self.timeout)?;
        if let Some(mut input) = held_input {
            input.close();
        }
        let duration = start.elapsed();

        let drain_deadline = Instant::now() + OUTPUT_DRAIN_GRACE;
        let (stdout, stdout_closed) = OutputCapture::finish_opt(stdout, drain_deadline);
        let (mut stderr, stderr_closed) = OutputCapture::finish_opt(stderr, drain_deadline);
        if !(stdout_closed && stderr_closed) {
            // Something left in the group still holds the pipes.
            guard.kill_group();
        }
        if timed_out {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str(&format!("Process timed out after {:?}.", self.timeout));
        }

        let exit_code = status
            .and_then(|status| status.code())
            .unwrap_or(if timed_out { TIMEOUT_EXIT_CODE } else { -1 });

        let result = CommandResult {
            exit_code,
            stdout,
            stderr,
            duration,
            timed_out,
        };

        if result.success() {
            debug!(
                command = %command_line,
                duration_ms = duration.as_millis() as u64,
                "Command completed"
            );
        } else {
            warn!(
                command = %command_line,
                exit_code,
                timed_out,
                duration_ms = duration.as_millis() as u64,
                stderr = %result.stderr.trim(),
                "Command failed"
            );
        }
        Ok(result)
    }
}

/// Owns a child process and guarantees it is killed and reaped.
pub(crate) struct ChildGuard {
    pub(crate) child: Child,
    reaped: bool,
}

impl ChildGuard {
    pub(crate) fn new(child: Child) -> Self {
        Self {
            child,
            reaped: false,
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking status check; true once the child has exited.
    pub(crate) fn has_exited(&mut self) -> HarnessResult<bool> {
        let exited = self.child.try_wait()?.is_some();
        if exited {
            self.reaped = true;
        }
        Ok(exited)
    }

    /// Wait for exit, killing the child once `timeout` elapses.
    /// Returns the exit status (if any) and whether the timeout fired.
    pub(crate) fn wait_timeout(
        &mut self,
        timeout: Duration,
    ) -> HarnessResult<(Option<ExitStatus>, bool)> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.reaped = true;
                return Ok((Some(status), false));
            }

            if start.elapsed() >= timeout {
                warn!(pid = self.child.id(), ?timeout, "Killing process group after timeout");
                self.kill_group();
                let status = self.child.wait().ok();
                self.reaped = true;
                return Ok((status, true));
            }

            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Kill (if still running) and reap.
    pub(crate) fn stop(&mut self) -> HarnessResult<()> {
        if self.reaped {
            return Ok(());
        }
        self.kill_group();
        let status = self.child.wait()?;
        self.reaped = true;
        debug!(pid = self.child.id(), ?status, "Process stopped");
        Ok(())
    }

    /// SIGKILL the child's process group, falling back to the child alone
    /// if the group is already gone.
    pub(crate) fn kill_group(&mut self) {
        let pgid = Pid::from_raw(self.child.id() as i32);
        if let Err(errno) = killpg(pgid, Signal::SIGKILL) {
            debug!(pid = self.child.id(), %errno, "Process group not signalled");
            if !self.reaped {
                let _ = self.child.kill();
            }
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill_group();
            let _ = self.child.wait();
        }
    }
}

/// Background collector for one output stream.
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<()>,
}

impl OutputCapture {
    fn spawn<R: Read + Send + 'static>(mut reader: R) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let (tx, done) = mpsc::channel();
        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => lock(&sink).extend_from_slice(&chunk[..n]),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = tx.send(());
        });
        Self { buffer, done }
    }

    /// Whatever was captured once the stream closes or `deadline` passes,
    /// and whether the stream closed.
    fn finish(self, deadline: Instant) -> (String, bool) {
        let wait = deadline.saturating_duration_since(Instant::now());
        let closed = self.done.recv_timeout(wait).is_ok();
        if !closed {
            warn!("Output stream still open after process exit; using partial output");
        }
        (String::from_utf8_lossy(&lock(&self.buffer)).into_owned(), closed)
    }

    fn finish_opt(capture: Option<Self>, deadline: Instant) -> (String, bool) {
        capture.map_or((String::new(), true), |c| c.finish(deadline))
    }
}

/// Search the build output directories under `repo_root` for `name` built
/// for `platform` (`<os>/<arch>`), returning the most recently modified one.
pub fn find_binary(repo_root: &Path, name: &str, platform: &str) -> HarnessResult<PathBuf> {
    let mut best: Option<(SystemTime, PathBuf)> = None;

    for prefix in BINARY_PREFIXES {
        let candidate = repo_root.join(prefix).join(platform).join(name);
        let Ok(metadata) = fs::metadata(&candidate) else {
            continue;
        };
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if best.as_ref().is_none_or(|(newest, _)| modified > *newest) {
            best = Some((modified, candidate));
        }
    }

    best.map(|(_, path)| path).ok_or_else(|| {
        HarnessError::Setup(format!(
            "could not find {name} for {platform} under {}",
            repo_root.display()
        ))
    })
}

/// Extract the port from the client proxy's startup banner.
pub fn parse_proxy_port(output: &str) -> Option<u16> {
    PROXY_PORT_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// How the client's API proxy should listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyBinding {
    /// TCP port; 0 lets the OS choose and the port is read from stdout.
    Port(u16),
    /// Filesystem path of a Unix-domain socket.
    UnixSocket(PathBuf),
}

/// Where a running [`ClientProxy`] can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientProxyEndpoint {
    Tcp(u16),
    Unix(PathBuf),
}

/// A running `<client> proxy` process.
pub struct ClientProxy {
    guard: ChildGuard,
    endpoint: ClientProxyEndpoint,
}

impl ClientProxy {
    /// Start the proxy and wait (up to `timeout`) until it is serving.
    pub fn start(
        config: &HarnessConfig,
        binding: ProxyBinding,
        timeout: Duration,
    ) -> HarnessResult<Self> {
        let args: Vec<String> = match &binding {
            ProxyBinding::Port(port) => vec!["proxy".into(), "-p".into(), port.to_string()],
            ProxyBinding::UnixSocket(path) => {
                vec!["proxy".into(), format!("--unix-socket={}", path.display())]
            }
        };
        let command = ClientCommand::new(config, args).without_namespace();
        info!(command = %command.command_line(), "Starting client proxy");

        let mut cmd = command.to_command();
        cmd.stdin(Stdio::null()).stderr(Stdio::null());
        match binding {
            ProxyBinding::Port(_) => {
                cmd.stdout(Stdio::piped());
            }
            ProxyBinding::UnixSocket(_) => {
                cmd.stdout(Stdio::null());
            }
        }
        let child = cmd.spawn().map_err(|e| {
            HarnessError::ProcessStartFailed(format!("{}: {e}", config.client_binary().display()))
        })?;
        let mut guard = ChildGuard::new(child);

        let endpoint = match binding {
            ProxyBinding::Port(_) => {
                let stdout = guard.child.stdout.take().ok_or_else(|| {
                    HarnessError::Setup("client proxy stdout was not captured".to_string())
                })?;
                ClientProxyEndpoint::Tcp(read_proxy_port(stdout, timeout)?)
            }
            ProxyBinding::UnixSocket(path) => {
                wait_for_socket(&path, timeout, &mut guard)?;
                ClientProxyEndpoint::Unix(path)
            }
        };

        info!(pid = guard.id(), ?endpoint, "Client proxy serving");
        Ok(Self { guard, endpoint })
    }

    pub fn endpoint(&self) -> &ClientProxyEndpoint {
        &self.endpoint
    }

    pub fn port(&self) -> Option<u16> {
        match self.endpoint {
            ClientProxyEndpoint::Tcp(port) => Some(port),
            ClientProxyEndpoint::Unix(_) => None,
        }
    }

    pub fn socket_path(&self) -> Option<&Path> {
        match &self.endpoint {
            ClientProxyEndpoint::Unix(path) => Some(path),
            ClientProxyEndpoint::Tcp(_) => None,
        }
    }

    /// `http://127.0.0.1:<port>` for a TCP-bound proxy.
    pub fn base_url(&self) -> Option<String> {
        self.port().map(|port| format!("http://127.0.0.1:{port}"))
    }

    pub fn stop(mut self) -> HarnessResult<()> {
        self.guard.stop()
    }
}

fn read_proxy_port<R: Read + Send + 'static>(stdout: R, timeout: Duration) -> HarnessResult<u16> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        let mut seen = String::new();
        let mut line = String::new();
        let mut reported = false;
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) if !reported => {
                    seen.push_str(&line);
                    if let Some(port) = parse_proxy_port(&seen) {
                        let _ = tx.send(Ok(port));
                        reported = true;
                    }
                }
                // Keep draining so the proxy never blocks on a full pipe.
                Ok(_) => {}
            }
        }
        if !reported {
            let _ = tx.send(Err(seen));
        }
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(port)) => Ok(port),
        Ok(Err(output)) => Err(HarnessError::Parse {
            what: "client proxy port".to_string(),
            detail: format!("no serving banner in output: {output:?}"),
        }),
        Err(_) => Err(HarnessError::Timeout(timeout)),
    }
}

/// Wait for a socket using exponential backoff for more reliable detection.
///
/// Starts with a 10ms delay and doubles up to 500ms. The socket file can
/// exist before the server accepts, so readiness is a successful connect.
fn wait_for_socket(
    socket_path: &Path,
    max_wait: Duration,
    guard: &mut ChildGuard,
) -> HarnessResult<()> {
    let start = Instant::now();
    let mut delay = Duration::from_millis(10);
    let max_delay = Duration::from_millis(500);

    while start.elapsed() < max_wait {
        if guard.has_exited()? {
            return Err(HarnessError::Setup(format!(
                "client proxy exited before serving on {}",
                socket_path.display()
            )));
        }
        if socket_path.exists() {
            match std::os::unix::net::UnixStream::connect(socket_path) {
                Ok(_) => {
                    debug!(
                        path = %socket_path.display(),
                        elapsed = ?start.elapsed(),
                        "Socket ready"
                    );
                    return Ok(());
                }
                Err(err) => {
                    debug!(%err, "Socket exists but not connectable yet; retrying");
                }
            }
        }
        thread::sleep(delay);
        delay = (delay * 2).min(max_delay);
    }

    warn!(path = %socket_path.display(), ?max_wait, "Socket never became ready");
    Err(HarnessError::Timeout(max_wait))
}

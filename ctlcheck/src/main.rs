//! ctlcheck - verification helpers for a cluster CLI client
//!
//! Exposes the harness primitives that are useful outside a test binary:
//! the logging forward proxy, the ordered output verifier, conflict-retrying
//! client runs and build-tree binary discovery.

#![forbid(unsafe_code)]

use std::io::{BufRead, Read};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use ctlcheck_common::config::{HarnessConfig, parse_duration};
use ctlcheck_common::{
    ClientCommand, HarnessError, ProxyHarness, RequirementGroup, check_output, find_binary,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ctlcheck")]
#[command(author, version, about = "Black-box verification helpers for a cluster CLI client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Harness config file (TOML); defaults to $CTLCHECK_CONFIG
    #[arg(short, long, global = true, env = "CTLCHECK_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a logging forward proxy and print what passes through it
    ///
    /// Prints the endpoint first, then one line per CONNECT or proxied
    /// request. Stops at end of stdin or after --for.
    Proxy {
        /// Stop after this long (e.g. "30s", "5m")
        #[arg(long = "for", value_name = "DURATION")]
        run_for: Option<String>,
    },

    /// Check that text contains requirement groups in top-to-bottom order
    ///
    /// Each --require is a comma-separated group: an anchor token followed
    /// by tokens that must appear on the same line.
    CheckOutput {
        /// Requirement group, e.g. "Replicas:,1 current,1 desired"
        #[arg(short, long = "require", required = true)]
        require: Vec<String>,

        /// Read text from this file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Run the configured client, printing its stdout
    Run {
        /// Retry optimistic-lock conflicts using the configured policy
        #[arg(long)]
        retry_conflicts: bool,

        /// Namespace for this invocation
        #[arg(short, long)]
        namespace: Option<String>,

        /// Arguments passed to the client
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },

    /// Locate the newest client build under a source tree
    FindBinary {
        /// Repository root
        #[arg(long)]
        repo_root: Option<PathBuf>,

        /// Binary name
        #[arg(long, default_value = "kubectl")]
        name: String,

        /// <os>/<arch>; defaults to the configured platform
        #[arg(long)]
        platform: Option<String>,
    },
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "ctlcheck={default_level},ctlcheck_common={default_level}"
        ))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = HarnessConfig::load(cli.config.as_deref()).context("loading harness config")?;
    debug!(?config, "Harness config loaded");

    match cli.command {
        Commands::Proxy { run_for } => {
            let run_for = run_for
                .map(|raw| parse_duration(&raw).ok_or_else(|| anyhow!("invalid duration: {raw}")))
                .transpose()?;
            run_proxy(run_for)
        }
        Commands::CheckOutput { require, file } => run_check_output(&require, file),
        Commands::Run {
            retry_conflicts,
            namespace,
            args,
        } => run_client(&config, retry_conflicts, namespace, args),
        Commands::FindBinary {
            repo_root,
            name,
            platform,
        } => {
            let repo_root = repo_root
                .or(config.repo_root.clone())
                .ok_or_else(|| anyhow!("--repo-root is required when no repo_root is configured"))?;
            let platform = platform.unwrap_or_else(|| config.platform.clone());
            let path = find_binary(&repo_root, &name, &platform)?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn run_proxy(run_for: Option<Duration>) -> Result<()> {
    let proxy = ProxyHarness::start()?;
    println!("{}", proxy.endpoint());

    let (stop_tx, stop_rx) = mpsc::channel();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            if line.is_err() {
                break;
            }
        }
        let _ = stop_tx.send(());
    });

    let deadline = run_for.map(|d| Instant::now() + d);
    let mut printed = 0;
    loop {
        for line in proxy.log().lines_since(printed) {
            println!("{line}");
            printed += 1;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("Proxy run time elapsed");
            break;
        }
        if stop_rx.recv_timeout(Duration::from_millis(100)).is_ok() {
            info!("Input closed; stopping proxy");
            break;
        }
    }

    for line in proxy.log().lines_since(printed) {
        println!("{line}");
    }
    proxy.stop();
    Ok(())
}

fn run_check_output(require: &[String], file: Option<PathBuf>) -> Result<()> {
    let text = match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("reading stdin")?;
            text
        }
    };

    let groups: Vec<RequirementGroup> =
        require.iter().map(|g| RequirementGroup::parse(g)).collect();
    match check_output(&text, &groups) {
        Ok(lines) => {
            for (group, line) in groups.iter().zip(lines) {
                println!("{}: line {}", group.anchor().unwrap_or_default(), line + 1);
            }
            Ok(())
        }
        Err(err @ HarnessError::VerificationMismatch { .. }) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
        Err(err) => Err(err.into()),
    }
}

fn run_client(
    config: &HarnessConfig,
    retry_conflicts: bool,
    namespace: Option<String>,
    args: Vec<String>,
) -> Result<()> {
    let mut command = ClientCommand::new(config, args);
    if let Some(namespace) = namespace {
        command = command.namespace(namespace);
    }

    if retry_conflicts {
        let stdout = command.exec_with_conflict_retry()?;
        print!("{stdout}");
        return Ok(());
    }

    let result = command.exec()?;
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if !result.success() {
        std::process::exit(result.exit_code);
    }
    Ok(())
}

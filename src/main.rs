//! legiond binary: CLI parsing, logging, pidfile claim, daemonization,
//! and the legion run loop with restart policy.
//!
//! Exit codes: 0 normal, 1 config or send-signal failure, 2 fatal
//! startup error (pidfile claim, sanity failure), 3 unexpected error
//! inside the start-limit window. After the window, an unexpected error
//! restarts the loop with exponential backoff capped at 60 seconds.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info, warn};

use legiond::events::{Bus, LogSubscriber, SubscriberSet};
use legiond::legion::{Legion, LegionParams, Outcome};
use legiond::pidfile::{self, PidClaim};

/// Unexpected errors within this window of startup are fatal.
const START_LIMIT: Duration = Duration::from_secs(30);
/// Restart backoff cap after the start-limit window.
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(
    name = "legiond",
    version,
    about = "Unix process supervisor: runs a declared set of tasks from a live configuration"
)]
struct Cli {
    /// Verbose logging for debugging.
    #[arg(short, long)]
    verbose: bool,

    /// Warnings and errors only.
    #[arg(short, long)]
    quiet: bool,

    /// Log to stderr instead of syslog.
    #[arg(short = 'e', long)]
    log_stderr: bool,

    /// Logging name, used to distinguish instances.
    #[arg(short = 'L', long, value_name = "NAME")]
    logging_name: Option<String>,

    /// Run in the background.
    #[arg(short, long)]
    background: bool,

    /// Pidfile path; '-' disables the pidfile.
    #[arg(short, long, value_name = "FILE", default_value = "/var/run/legiond.pid")]
    pidfile: String,

    /// Configuration document.
    #[arg(short = 'f', long, value_name = "FILE", default_value = "/etc/legiond.conf")]
    config_file: PathBuf,

    /// Roles file, one role per line.
    #[arg(short = 'r', long, value_name = "FILE")]
    roles_file: Option<PathBuf>,

    /// Status/control listener (host:port or a socket path); merged
    /// into the first configured listener.
    #[arg(long, value_name = "LISTEN")]
    http: Option<String>,

    /// PEM file with certificate and key; enables TLS on the first
    /// listener.
    #[arg(long, value_name = "FILE")]
    certfile: Option<String>,

    /// Allow control operations on the first listener.
    #[arg(long)]
    allow_control: bool,

    /// Validate the configuration and exit.
    #[arg(long)]
    check_config: bool,

    /// Ask a running instance to reset (SIGHUP) and exit.
    #[arg(long)]
    reset: bool,

    /// Ask a running instance to stop (SIGTERM) and exit.
    #[arg(long)]
    stop: bool,

    /// Stop the whole supervisor after this many seconds.
    #[arg(long, value_name = "SECS")]
    expires: Option<f64>,

    /// Run startup self-checks and exit.
    #[arg(long)]
    sanity: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    if cli.stop || cli.reset {
        let sig = if cli.stop {
            nix::sys::signal::Signal::SIGTERM
        } else {
            nix::sys::signal::Signal::SIGHUP
        };
        return match pidfile::signal_instance(std::path::Path::new(&cli.pidfile), sig) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "signal delivery failed");
                ExitCode::from(1)
            }
        };
    }

    let params = LegionParams {
        config_file: cli.config_file.clone(),
        roles_file: cli.roles_file.clone(),
        http_listen: cli.http.clone(),
        allow_control: cli.allow_control,
        certfile: cli.certfile.clone(),
        expires: cli.expires.filter(|s| *s > 0.0).map(Duration::from_secs_f64),
        module_path: None,
    };

    if cli.check_config {
        return match Legion::check_config(&params) {
            Ok(()) => {
                info!(config = %params.config_file.display(), "configuration is valid");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "configuration is invalid");
                ExitCode::from(1)
            }
        };
    }
    if cli.sanity {
        return match sanity(&cli, &params) {
            Ok(()) => ExitCode::SUCCESS,
            Err(reason) => {
                error!(reason, "sanity check failed");
                ExitCode::from(2)
            }
        };
    }

    if cli.background {
        if let Err(e) = nix::unistd::daemon(false, false) {
            error!(error = %e, "daemonize failed");
            return ExitCode::from(2);
        }
    }

    let _claim = if cli.pidfile != "-" {
        match PidClaim::claim(std::path::Path::new(&cli.pidfile)) {
            Ok(claim) => Some(claim),
            Err(e) => {
                error!(error = %e, "startup failed");
                return ExitCode::from(2);
            }
        }
    } else {
        None
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "runtime construction failed");
            return ExitCode::from(2);
        }
    };
    runtime.block_on(supervise(params))
}

/// Runs legions until stop, reset, or a fatal error, restarting the
/// loop with capped backoff after the start-limit window.
async fn supervise(params: LegionParams) -> ExitCode {
    let bus = Bus::new(1024);
    let subs = Arc::new(SubscriberSet::new(vec![Arc::new(LogSubscriber)], bus.clone()));
    subs.spawn_listener();

    let begin = Instant::now();
    let mut backoff = Duration::from_secs(1);
    loop {
        let mut legion = Legion::new(params.clone(), bus.clone());
        match legion.run().await {
            Ok(Outcome::Stopped) => return ExitCode::SUCCESS,
            Ok(Outcome::Reset) => reexec(),
            Err(e) if e.is_fatal() => {
                error!(error = %e, "fatal");
                return ExitCode::from(2);
            }
            Err(e) => {
                if begin.elapsed() < START_LIMIT {
                    error!(error = %e, "failed inside start limit");
                    return ExitCode::from(3);
                }
                error!(error = %e, retry_in = ?backoff, "legion failed, restarting");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);
            }
        }
    }
}

/// Replaces the process with a fresh copy of itself, original argv and
/// environment intact. Only returns on error.
fn reexec() -> ! {
    let mut args = std::env::args_os();
    let argv0 = args.next().unwrap_or_else(|| "legiond".into());
    info!("re-executing for reset");
    let err = std::process::Command::new(&argv0).args(args).exec();
    error!(error = %err, "re-exec failed");
    std::process::exit(3);
}

fn sanity(cli: &Cli, params: &LegionParams) -> Result<(), &'static str> {
    Legion::check_config(params).map_err(|_| "configuration does not validate")?;
    if let Some(roles) = &params.roles_file {
        if !roles.exists() {
            warn!(path = %roles.display(), "roles file missing; role processing will be inhibited");
        }
    }
    if cli.pidfile != "-" {
        let path = std::path::Path::new(&cli.pidfile);
        let dir = path.parent().unwrap_or(std::path::Path::new("/"));
        if !dir.is_dir() {
            return Err("pidfile directory does not exist");
        }
    }
    Ok(())
}

fn init_logging(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("legiond={level},{level}")));
    let name = cli.logging_name.clone().unwrap_or_else(|| "legiond".to_string());
    // Syslog transport is an external concern; everything goes to
    // stderr, which --log-stderr also selects.
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    if !cli.log_stderr {
        tracing::debug!(name = %name, "syslog transport not built in; logging to stderr");
    }
}

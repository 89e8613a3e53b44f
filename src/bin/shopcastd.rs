//! shopcast daemon - real-time status and notification delivery
//!
//! Accepts WebSocket connections from apps and dashboards, and delivers
//! booking, chat and alert events published by the platform services.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! shopcastd start
//!
//! # Start the daemon (background/daemonized)
//! shopcastd start -d
//!
//! # Start with an explicit config file
//! shopcastd start --config /etc/shopcast/shopcast.toml
//!
//! # Stop the daemon
//! shopcastd stop
//!
//! # Check daemon status
//! shopcastd status
//!
//! # Override the listen address and enable debug logging
//! SHOPCAST_LISTEN=0.0.0.0:9470 RUST_LOG=shopcastd=debug shopcastd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: graceful shutdown, open connections are closed with 1001

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shopcastd::auth::VerifierChain;
use shopcastd::config::ServiceConfig;
use shopcastd::Service;

/// shopcast daemon - real-time notification delivery
#[derive(Parser, Debug)]
#[command(name = "shopcastd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file (defaults to $SHOPCAST_CONFIG, then built-in defaults)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("shopcast")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("shopcastd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("shopcastd.log")
}

/// Reads the PID from the PID file, if it exists.
fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// Returns the PID of a running daemon, clearing a stale PID file.
fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

/// Sends SIGTERM to the daemon process.
fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let pid = i32::try_from(pid).context("PID out of range")?;
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'shopcastd stop' to stop it first.");
                process::exit(1);
            }

            // Fail before forking so config errors reach the terminal
            let config = ServiceConfig::load(config.as_deref())
                .context("Failed to load configuration")?;
            config.validate().context("Invalid configuration")?;

            if daemon {
                // Before the tokio runtime exists
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon(config);
            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                // Shutdown flushes queues, so allow a little longer than the flush timeout
                for _ in 0..100 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 10 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");
                if let Ok(config) = ServiceConfig::load(None) {
                    println!("Listening on: {}", config.server.listen);
                }
                println!("Log file: {}", log_file_path().display());
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = open_log(&log_path).context("Failed to open log file for stdout")?;
    let stderr = open_log(&log_path).context("Failed to open log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

fn open_log(path: &Path) -> std::io::Result<File> {
    fs::OpenOptions::new().create(true).append(true).open(path)
}

#[tokio::main]
async fn run_daemon(config: ServiceConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("shopcastd=info".parse()?)
                .add_directive("shopcast_core=info".parse()?)
                .add_directive("shopcast_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "shopcast daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let auth = VerifierChain::from_config(&config.auth).context("Failed to set up authentication")?;
    let service = Service::start(&config, Arc::new(auth), cancel_token)
        .await
        .context("Failed to start service")?;

    info!(addr = %service.local_addr(), "Accepting connections");

    if let Err(e) = service.join().await {
        error!(error = %e, "Service error");
        return Err(e.into());
    }

    info!("shopcast daemon stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

//! photowall daemon - broadcast wall server and relay broker
//!
//! This binary runs the wall server (uploads in, photos fanned out to every
//! viewer socket) or the standalone relay broker that several wall servers
//! share.
//!
//! # Usage
//!
//! ```bash
//! # Start the wall server (foreground)
//! walld start
//!
//! # Start daemonized with a config file
//! walld start -d --config /etc/photowall/walld.toml
//!
//! # Stop / inspect the running server
//! walld stop
//! walld status
//!
//! # Run the relay broker, then point servers at it
//! walld broker --socket /run/walld-broker.sock
//! WALL_RELAY=socket WALL_BROKER_SOCKET=/run/walld-broker.sock walld start
//!
//! # Enable debug logging
//! RUST_LOG=walld=debug walld start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use walld::broker::BrokerServer;
use walld::config::DEFAULT_BROKER_SOCKET;
use walld::{server, WallConfig, WallContext};

/// photowall daemon - real-time broadcast wall
#[derive(Parser, Debug)]
#[command(name = "walld", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the wall server
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// TOML config file; WALL_* environment variables override it
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Stop the running wall server
    Stop,
    /// Show wall server status
    Status,
    /// Run the standalone relay broker
    Broker {
        /// Unix socket to listen on
        #[arg(short, long, default_value = DEFAULT_BROKER_SOCKET)]
        socket: PathBuf,
    },
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("photowall")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("walld.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("walld.log")
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

/// Returns the PID of a live server, clearing a stale PID file.
fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let Ok(raw) = i32::try_from(pid) else {
            bail!("PID {} out of range", pid);
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        let result = unsafe { libc::kill(raw, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {}", pid);
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
                eprintln!("walld is already running (PID {pid})");
                eprintln!("Use 'walld stop' to stop it first.");
                process::exit(1);
            }

            // Fail on a bad config before forking so the error reaches the terminal.
            let config = WallConfig::load(config.as_deref()).context("Failed to load config")?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;
            let result = run_server(config);
            remove_pid_file();
            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping walld (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("walld stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("walld did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("walld is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("walld is running (PID {pid})");
                match WallConfig::load(None) {
                    Ok(config) => println!("Listening on: {}", config.listen),
                    Err(e) => println!("Listen address unknown: {e}"),
                }
                Ok(())
            } else {
                println!("walld is not running.");
                process::exit(1);
            }
        }
        Command::Broker { socket } => run_broker(&socket),
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = File::create(&log_path).context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("walld=info".parse()?)
                .add_directive("wall_core=info".parse()?)
                .add_directive("wall_protocol=info".parse()?),
        )
        .init();
    Ok(())
}

/// Cancels `token` on the first SIGTERM or SIGINT.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        token.cancel();
    });
}

#[tokio::main]
async fn run_server(config: WallConfig) -> Result<()> {
    init_logging()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        listen = %config.listen,
        "photowall daemon starting"
    );

    let ctx = WallContext::from_config(config).into_shared();
    ctx.start().context("Failed to start pipeline")?;

    let signal_token = CancellationToken::new();
    spawn_signal_handler(signal_token.clone());

    // Returns only after the context shutdown has run to completion.
    let report = server::serve(std::sync::Arc::clone(&ctx), async move {
        signal_token.cancelled().await
    })
    .await
    .context("Server error")?;

    if !report.aborted.is_empty() {
        warn!(aborted = ?report.aborted, "Tasks aborted after grace period");
    }
    info!("photowall daemon stopped");
    Ok(())
}

#[tokio::main]
async fn run_broker(socket: &Path) -> Result<()> {
    init_logging()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "Relay broker starting"
    );

    let cancel_token = CancellationToken::new();
    spawn_signal_handler(cancel_token.clone());

    let broker = BrokerServer::new(socket, cancel_token);
    if let Err(e) = broker.run().await {
        error!(error = %e, "Broker error");
        return Err(e.into());
    }

    info!("Relay broker stopped");
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

//! kmsgcast daemon - streams the kernel log to TCP subscribers
//!
//! This binary reads kernel log records and pushes every line to each
//! connected TCP client.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! kmsgcastd start
//!
//! # Start the daemon (background/daemonized)
//! kmsgcastd start -d
//!
//! # Serve stdin on a custom port
//! dmesg -w | kmsgcastd start --source - --port 3000
//!
//! # Stop the daemon
//! kmsgcastd stop
//!
//! # Check daemon status
//! kmsgcastd status
//! ```

use std::fs::{self, OpenOptions};
use std::io::SeekFrom;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::io::{AsyncRead, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kmsgcastd::config::DEFAULT_SOURCE;
use kmsgcastd::server::{Server, TcpAcceptor};
use kmsgcastd::source::{pump_reader, spawn_pump, LogHub};
use kmsgcastd::ServerConfig;

const STOP_POLL_ATTEMPTS: u32 = 50;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long runtime teardown waits for a source read stuck in the kernel
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// kmsgcast daemon - kernel log broadcaster
#[derive(Parser, Debug)]
#[command(name = "kmsgcastd", version, about)]
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

        #[command(flatten)]
        overrides: Overrides,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

/// Settings that take precedence over the config file and environment.
#[derive(ClapArgs, Debug, Default)]
struct Overrides {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Maximum number of simultaneous subscribers
    #[arg(long)]
    max_subscribers: Option<usize>,

    /// Log source path (`-` for stdin)
    #[arg(long)]
    source: Option<PathBuf>,
}

impl Overrides {
    /// Builds the effective configuration: file, then environment, then flags.
    fn load(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };

        config.apply_env(|var| std::env::var(var).ok())?;

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(max) = self.max_subscribers {
            config.max_subscribers = max;
        }
        if let Some(source) = &self.source {
            config.source = source.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("kmsgcast")
}

fn log_file_path() -> PathBuf {
    state_dir().join("kmsgcastd.log")
}

/// PID file marking a running daemon.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn new() -> Self {
        Self {
            path: state_dir().join("kmsgcastd.pid"),
        }
    }

    fn read(&self) -> Option<u32> {
        fs::read_to_string(&self.path).ok()?.trim().parse().ok()
    }

    fn write(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        fs::write(&self.path, process::id().to_string())
            .with_context(|| format!("Failed to write PID file {}", self.path.display()))
    }

    fn remove(&self) {
        let _ = fs::remove_file(&self.path);
    }

    /// PID of the running daemon. A stale file is cleaned up.
    fn running_pid(&self) -> Option<u32> {
        let pid = self.read()?;
        if is_process_running(pid) {
            return Some(pid);
        }
        self.remove();
        None
    }
}

fn is_process_running(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

fn send_sigterm(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let pid = libc::pid_t::try_from(pid).context("PID out of range")?;
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop is only supported on Unix systems (PID {pid})");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let pid_file = PidFile::new();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        overrides: Overrides::default(),
    });

    match command {
        Command::Start { daemon, overrides } => {
            if let Some(pid) = pid_file.running_pid() {
                eprintln!("kmsgcastd is already running (PID {pid})");
                eprintln!("Run 'kmsgcastd stop' first.");
                process::exit(1);
            }

            // Fail before forking so configuration errors reach the terminal
            let config = overrides.load()?;

            if daemon {
                if config.reads_stdin() {
                    bail!("Cannot read the log source from stdin when daemonized");
                }
                daemonize()?;
            }

            pid_file.write()?;
            let result = run(config);
            pid_file.remove();
            result
        }
        Command::Stop => {
            let Some(pid) = pid_file.running_pid() else {
                println!("kmsgcastd is not running.");
                return Ok(());
            };

            println!("Stopping kmsgcastd (PID {pid})...");
            send_sigterm(pid)?;

            for _ in 0..STOP_POLL_ATTEMPTS {
                if !is_process_running(pid) {
                    println!("Stopped.");
                    return Ok(());
                }
                std::thread::sleep(STOP_POLL_INTERVAL);
            }

            eprintln!("kmsgcastd did not stop within 5 seconds.");
            process::exit(1);
        }
        Command::Status => match pid_file.running_pid() {
            Some(pid) => {
                println!("kmsgcastd is running (PID {pid})");
                println!("Log file: {}", log_file_path().display());
                Ok(())
            }
            None => {
                println!("kmsgcastd is not running.");
                process::exit(1);
            }
        },
    }
}

/// Forks into the background, sending stdout and stderr to the log file.
fn daemonize() -> Result<()> {
    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;
    let log_err = log.try_clone().context("Failed to duplicate log file handle")?;

    daemonize::Daemonize::new()
        .working_directory("/")
        .stdout(log)
        .stderr(log_err)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

/// Runs the daemon on a dedicated runtime.
///
/// A read blocked on the log source cannot be interrupted, so runtime
/// teardown is bounded instead of waiting for it.
fn run(config: ServerConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    let result = runtime.block_on(run_daemon(config));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    result
}

async fn run_daemon(config: ServerConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("kmsgcastd=info".parse()?)
                .add_directive("kmsgcast=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "kmsgcast daemon starting"
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

    let hub = Arc::new(LogHub::new());

    let backlog = u32::try_from(config.max_subscribers).unwrap_or(u32::MAX);
    let acceptor = TcpAcceptor::bind(config.listen_addr(), backlog)?;
    let server = Server::new(acceptor, hub.clone(), &config, cancel_token.clone()).spawn();
    info!(max_subscribers = config.max_subscribers, "Lifecycle loop started");

    let (sender, pump) = spawn_pump(hub, config.pump_capacity, cancel_token.clone());

    let format = config.effective_source_format();
    let source = open_source(&config.source, config.reads_stdin()).await?;
    info!(source = %config.source.display(), format = ?format, "Reading log source");

    let reader_token = cancel_token.clone();
    let reader = tokio::spawn(async move {
        match pump_reader(source, format, sender, reader_token).await {
            Ok(stats) => info!(lines = stats.lines, dropped = stats.dropped, "Log source closed"),
            Err(e) => error!(error = %e, "Failed to read log source"),
        }
    });

    let report = server.wait().await?;
    info!(
        admitted = report.admitted,
        rejected = report.rejected,
        reclaimed = report.reclaimed,
        drained = report.drained.len(),
        "Server stopped"
    );

    if let Ok(stats) = pump.await {
        info!(lines = stats.lines, "Line pump stopped");
    }
    // The reader may be parked in a blocking read; do not wait for it
    reader.abort();

    info!("kmsgcast daemon stopped");
    Ok(())
}

async fn open_source(path: &Path, stdin: bool) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
    if stdin {
        return Ok(Box::new(tokio::io::stdin()));
    }

    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open log source {}", path.display()))?;

    // Subscribers get live records only, not the ring buffer backlog
    if path == Path::new(DEFAULT_SOURCE) {
        if let Err(e) = file.seek(SeekFrom::End(0)).await {
            warn!(error = %e, "Could not skip kernel log backlog");
        }
    }
    Ok(Box::new(file))
}

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

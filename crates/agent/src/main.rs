//! shellmux agent
//!
//! Multiplexes interactive remote shells over the pipes inherited from a
//! parent controller: control messages on stdin/stdout, session data on two
//! extra descriptors.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncRead, AsyncWrite};
#[cfg(unix)]
use tokio::net::unix::pipe;
use tracing_subscriber::EnvFilter;

use agent::config::Config;
use agent::network::{SshConnector, TcpDialer, TrustPolicy};
use agent::orchestrator::{AgentChannels, AgentOrchestrator};

/// shellmux agent - remote shell multiplexer.
#[derive(Parser, Debug)]
#[command(name = "shellmux-agent")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the agent.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve control and data channels until the controller goes away
    Run {
        /// Descriptor carrying inbound session frames
        #[arg(long, value_name = "FD")]
        data_in_fd: Option<i32>,

        /// Descriptor carrying outbound session frames
        #[arg(long, value_name = "FD")]
        data_out_fd: Option<i32>,
    },

    /// Print the effective configuration as TOML
    Config,
}

/// Logs go to stderr; stdout carries control events.
fn init_tracing(cli: &Cli, config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if cli.verbose {
            "debug".to_string()
        } else {
            config.agent.log_level.to_lowercase()
        };
        EnvFilter::new(level)
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// How long in-flight work may run once the agent has stopped.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run_cli());

    // Blocking-pool I/O still in flight (a console stdin, a stalled stdout)
    // must not keep the process alive after the agent has stopped.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    init_tracing(&cli, &config);
    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Run {
            data_in_fd,
            data_out_fd,
        } => {
            if let Some(fd) = data_in_fd {
                config.channels.data_in_fd = fd;
            }
            if let Some(fd) = data_out_fd {
                config.channels.data_out_fd = fd;
            }
            config.validate()?;
            run_agent(config).await
        }
        Commands::Config => {
            config.validate()?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run_agent(config: Config) -> Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "shellmux agent starting");

    if config.trust.trust_overlay {
        tracing::warn!("Host key verification disabled; trusting the overlay network");
    }

    let control_in = open_control_input().context("Failed to open control input")?;
    let data_in = open_inherited_reader(config.channels.data_in_fd)
        .with_context(|| format!("Failed to open data input fd {}", config.channels.data_in_fd))?;
    let data_out = open_inherited_writer(config.channels.data_out_fd).with_context(|| {
        format!("Failed to open data output fd {}", config.channels.data_out_fd)
    })?;

    let connector = SshConnector::new(TcpDialer::new(), TrustPolicy::from(&config.trust));
    let orchestrator = AgentOrchestrator::new(config, connector);

    let shutdown = orchestrator.shutdown_token();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal");
                shutdown.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "Failed to install signal handlers"),
        }
    });

    orchestrator
        .run(AgentChannels {
            control_in,
            control_out: tokio::io::stdout(),
            data_in,
            data_out,
        })
        .await
}

type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;
type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Take ownership of a descriptor inherited from the parent process.
#[cfg(unix)]
fn inherited_file(fd: i32) -> Result<std::fs::File> {
    use std::os::fd::FromRawFd;

    let path = PathBuf::from(format!("/dev/fd/{}", fd));
    if cfg!(target_os = "linux") && !path.exists() {
        anyhow::bail!("descriptor {} is not open", fd);
    }

    // SAFETY: the parent hands this descriptor over at spawn time and no
    // other owner exists in this process.
    Ok(unsafe { std::fs::File::from_raw_fd(fd) })
}

/// Pipes and sockets are driven by the reactor so a pending read never
/// occupies a blocking thread; anything else goes through `tokio::fs`.
#[cfg(unix)]
fn reader_from_file(file: std::fs::File) -> Result<ChannelReader> {
    use std::os::unix::fs::FileTypeExt;

    let file_type = file.metadata()?.file_type();
    if file_type.is_fifo() {
        Ok(Box::new(pipe::Receiver::from_file(file)?))
    } else if file_type.is_socket() {
        Ok(Box::new(unix_stream_from_file(file)?))
    } else {
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }
}

#[cfg(unix)]
fn writer_from_file(file: std::fs::File) -> Result<ChannelWriter> {
    use std::os::unix::fs::FileTypeExt;

    let file_type = file.metadata()?.file_type();
    if file_type.is_fifo() {
        Ok(Box::new(pipe::Sender::from_file(file)?))
    } else if file_type.is_socket() {
        Ok(Box::new(unix_stream_from_file(file)?))
    } else {
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }
}

#[cfg(unix)]
fn unix_stream_from_file(file: std::fs::File) -> Result<tokio::net::UnixStream> {
    let stream = std::os::unix::net::UnixStream::from(std::os::fd::OwnedFd::from(file));
    stream.set_nonblocking(true)?;
    Ok(tokio::net::UnixStream::from_std(stream)?)
}

#[cfg(unix)]
fn open_inherited_reader(fd: i32) -> Result<ChannelReader> {
    reader_from_file(inherited_file(fd)?)
}

#[cfg(unix)]
fn open_inherited_writer(fd: i32) -> Result<ChannelWriter> {
    writer_from_file(inherited_file(fd)?)
}

/// Control messages arrive on stdin. A piped stdin is read through the
/// reactor; a console falls back to `tokio::io::stdin`.
#[cfg(unix)]
fn open_control_input() -> Result<ChannelReader> {
    use std::os::fd::AsFd;
    use std::os::unix::fs::FileTypeExt;

    let stdin = std::io::stdin().as_fd().try_clone_to_owned()?;
    let file = std::fs::File::from(stdin);
    let file_type = file.metadata()?.file_type();
    if file_type.is_fifo() || file_type.is_socket() {
        reader_from_file(file)
    } else {
        Ok(Box::new(tokio::io::stdin()))
    }
}

#[cfg(not(unix))]
fn open_inherited_reader(fd: i32) -> Result<ChannelReader> {
    anyhow::bail!("inherited descriptor {} is only supported on unix", fd)
}

#[cfg(not(unix))]
fn open_inherited_writer(fd: i32) -> Result<ChannelWriter> {
    anyhow::bail!("inherited descriptor {} is only supported on unix", fd)
}

#[cfg(not(unix))]
fn open_control_input() -> Result<ChannelReader> {
    Ok(Box::new(tokio::io::stdin()))
}

/// Wait for SIGTERM or SIGINT.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

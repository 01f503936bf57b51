//! muxcast daemon
//!
//! Streams persistent tmux sessions to any number of WebSocket viewers.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::events::EngineEvent;
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// muxcast daemon - share terminal sessions with many viewers.
#[derive(Parser, Debug)]
#[command(name = "muxcastd")]
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

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the daemon in the foreground
    Serve {
        /// Listen address, overriding the configuration
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Configuration subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Print the configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Serve { bind } => {
            let mut config = Config::load(&config_path)?;
            config.apply_env_overrides();
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }

            let _guard = init_tracing(&config, cli.verbose)?;
            tracing::info!("Using config file: {:?}", config_path);

            config.validate()?;

            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run(&mut orchestrator).await?;
        }
        Commands::Config(command) => match command {
            ConfigCommands::Show => {
                let mut config = Config::load(&config_path)?;
                config.apply_env_overrides();
                print!("{}", config.to_toml()?);
            }
            ConfigCommands::Path => {
                println!("{}", config_path.display());
            }
            ConfigCommands::Init { force } => {
                if config_path.exists() && !force {
                    anyhow::bail!(
                        "Config file already exists at {} (use --force to overwrite)",
                        config_path.display()
                    );
                }
                Config::default().save(&config_path)?;
                println!("Wrote default configuration to {}", config_path.display());
            }
        },
    }

    Ok(())
}

/// Installs the tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. The returned guard flushes the
/// log file and must live until exit.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = if config.daemon.log_file {
        let dir = config.daemon_log_dir();
        std::fs::create_dir_all(&dir)?;
        let appender = tracing_appender::rolling::daily(dir, "muxcastd.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().with_ansi(false).with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

/// Runs the orchestrator until SIGINT or SIGTERM.
async fn run(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::Listening { addr } => {
                    tracing::info!("Accepting viewers on ws://{}", addr);
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    let mut engine = orchestrator.engine_events();
    tokio::spawn(async move {
        loop {
            match engine.recv().await {
                Ok(EngineEvent::SessionStarted { session, pid }) => {
                    tracing::info!(session = %session, pid = ?pid, "Session started");
                }
                Ok(EngineEvent::SessionTornDown { session, reason }) => {
                    tracing::info!(session = %session, reason = ?reason, "Session ended");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Engine event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

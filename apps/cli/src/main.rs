//! StealthWire CLI
//!
//! Runs the relay tasks of a node from a JSON task list.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};

use stealthwire_core::TrafficRegistry;
use stealthwire_daemon::{LogSink, MeteringReporter, SupervisionPolicy, TaskRunner};
use stealthwire_settings::{default_config_path, TunnelConfig};

/// StealthWire - encrypted transit/exit relay agent
#[derive(Parser)]
#[command(name = "stealthwire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every task in the config until interrupted
    Run {
        /// Task list (JSON)
        #[arg(short, long, default_value_os_t = default_config_path())]
        config: PathBuf,

        /// What to do when a session stops
        #[arg(long, value_enum, default_value_t = Policy::Isolated)]
        policy: Policy,

        /// Restart failed sessions (isolated policy only)
        #[arg(long)]
        restart: bool,

        /// Restart limit per session
        #[arg(long, default_value = "5")]
        max_restarts: u32,

        /// Seconds to wait before a restart
        #[arg(long, default_value = "1")]
        restart_backoff: u64,

        /// Seconds between traffic reports
        #[arg(long, default_value = "60")]
        report_interval: u64,
    },

    /// Validate a config file and print its tasks
    Check {
        /// Task list (JSON)
        #[arg(short, long, default_value_os_t = default_config_path())]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Policy {
    /// Keep other sessions running when one fails
    Isolated,
    /// Stop everything when one session stops
    FailFast,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    stealthwire_logging::init(cli.verbose);

    match cli.command {
        Commands::Run {
            config,
            policy,
            restart,
            max_restarts,
            restart_backoff,
            report_interval,
        } => {
            let policy = match policy {
                Policy::FailFast => {
                    if restart {
                        warn!("--restart has no effect with --policy fail-fast");
                    }
                    SupervisionPolicy::FailFast
                }
                Policy::Isolated => SupervisionPolicy::Isolated {
                    restart,
                    max_restarts,
                    backoff: Duration::from_secs(restart_backoff),
                },
            };
            #[cfg(unix)]
            stealthwire_daemon::raise_nofile_limit();
            run(config, policy, Duration::from_secs(report_interval.max(1))).await?;
        }
        Commands::Check { config } => {
            check(&config)?;
        }
    }

    Ok(())
}

async fn run(config_path: PathBuf, policy: SupervisionPolicy, report_interval: Duration) -> Result<()> {
    let config = TunnelConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let registry = Arc::new(TrafficRegistry::new());
    let runner = TaskRunner::from_config(config)?
        .with_policy(policy)
        .with_registry(registry.clone());
    let shutdown = runner.shutdown_token();

    let reporter = MeteringReporter::new(registry, LogSink).with_interval(report_interval);
    let reporter = tokio::spawn(reporter.run(shutdown.clone()));

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => {
                error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
        }
        signal.cancel();
    });

    let result = runner.run().await;
    // Stop the reporter too when the runner ended on its own.
    shutdown.cancel();
    if let Err(e) = reporter.await {
        warn!(error = %e, "metering reporter task failed");
    }

    let exits = result?;
    info!(sessions = exits.len(), "all sessions stopped");
    Ok(())
}

fn check(config_path: &Path) -> Result<()> {
    let config = TunnelConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    println!("{}: {} task(s) OK", config_path.display(), config.tasks.len());
    for task in &config.tasks {
        println!(
            "  #{:<6} {:<8} {} -> {} ({:?})",
            task.id,
            task.mode.to_string(),
            task.listen_addr,
            task.target_addr,
            task.cipher
        );
    }
    Ok(())
}

//! threatscan - command line front end
//!
//! Watches a directory, scans a list of files, or inspects analyses and
//! objects through the threat-intelligence API.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use threatscan::client::ResourceKind;
use threatscan::config::Config;
use threatscan::scan::{scan_files, DirectoryScanService, ScanOptions};
use threatscan::telemetry::init_tracing;
use threatscan::ThreatIntelClient;

/// threatscan - submit files to a threat-intelligence service
#[derive(Parser, Debug)]
#[command(name = "threatscan")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "THREATSCAN_CONFIG")]
    config: Option<PathBuf>,

    /// API key, overriding the configuration
    #[arg(long, env = "THREATSCAN_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch a directory and submit every newly created file
    Watch {
        /// Directory to watch, overriding `scan.directory`
        directory: Option<PathBuf>,

        /// File name patterns to ignore (repeatable)
        #[arg(short, long = "exclude")]
        exclude: Vec<String>,

        /// Wait before opening a new file, in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
    },

    /// Submit the given files and print the analysis ids
    Scan {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Maximum concurrent uploads, overriding `scan.max_concurrency`
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Password for protected archives
        #[arg(long)]
        password: Option<String>,
    },

    /// Show an analysis, optionally waiting for it to finish
    Analysis {
        id: String,

        /// Poll until the analysis reaches a terminal status
        #[arg(short, long)]
        wait: bool,
    },

    /// Fetch one object, e.g. `object files <sha256>`
    Object { kind: ResourceKind, id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(&args)?;
    if let Some(key) = &args.api_key {
        config.client.api_key = Some(key.clone());
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    init_tracing(&config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting threatscan");

    let client = ThreatIntelClient::from_config(&config)?;

    // Cancelled on Ctrl+C or SIGTERM
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    match args.command {
        Command::Watch {
            directory,
            exclude,
            delay_ms,
        } => {
            let mut scan_config = config.scan.clone();
            if directory.is_some() {
                scan_config.directory = directory;
            }
            if !exclude.is_empty() {
                scan_config.exclusion_filters = exclude;
            }
            if let Some(delay_ms) = delay_ms {
                scan_config.scan_delay_ms = delay_ms;
            }
            let options = ScanOptions::from_config(&scan_config)?.with_failure_hook(|path, err| {
                error!(path = %path.display(), error = %err, "Scan failed");
            });

            let service = DirectoryScanService::start(client.uploader(), options)?;
            info!(directory = %service.directory().display(), "Watching for new files");

            cancel.cancelled().await;
            let pending = service.in_flight();
            if pending > 0 {
                info!(pending = pending, "Waiting for in-flight scans");
            }
            service.shutdown().await;
        }
        Command::Scan {
            paths,
            concurrency,
            password,
        } => {
            let outcomes = scan_files(
                client.uploader(),
                paths,
                concurrency.unwrap_or(config.scan.max_concurrency),
                password.or_else(|| config.scan.password.clone()),
                &cancel,
            )
            .await?;

            let mut failed = 0usize;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(handle) => println!("{}\t{}", outcome.path.display(), handle.id),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{}\terror: {}", outcome.path.display(), e);
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{} of {} files failed", failed, outcomes.len());
            }
        }
        Command::Analysis { id, wait } => {
            let analysis = if wait {
                client.wait_for_analysis(&id, None, None, &cancel).await?
            } else {
                client.get_analysis(&id, &cancel).await?
            };
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
        Command::Object { kind, id } => {
            let object = client.get_object(kind, &id, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&object)?);
        }
    }

    info!("threatscan finished");
    Ok(())
}

/// Load configuration from file or environment
fn load_config(args: &Args) -> anyhow::Result<Config> {
    match &args.config {
        Some(path) => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from file: {}", path.display());
            Config::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
        None => Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e)),
    }
}

/// Resolves when a shutdown signal is received
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

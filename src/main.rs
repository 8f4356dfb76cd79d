use clap::{Parser, Subcommand};
use dolos::config::{self, Config, Settings};
use dolos::control::{ControlHandle, FeedCommand};
use dolos::engine::{BridgeUpdate, DiscoveryEvent};
use dolos::exec::{AuditLog, CommandRunner, DryRunRunner, SystemRunner};
use dolos::orchestrator::{Handles, Orchestrator};
use dolos::telemetry::{init_logging, Metrics};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::runtime::Runtime;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "dolos")]
#[command(about = "Control plane for a transparent 802.1x MitM bridge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the baseline and react to discovery events until stopped
    Run {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Record commands instead of running them
        #[arg(long)]
        dry_run: bool,

        /// JSON-lines event feed, `-` for stdin
        #[arg(long, default_value = "-")]
        events: String,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Flush every rule and restore default-accept (recovery after a crash)
    Flush {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate config.toml
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            dry_run,
            events,
        } => cmd_run(&config, dry_run, &events),
        Commands::Config {
            action: ConfigAction::Validate { config },
        } => cmd_config_validate(&config),
        Commands::Flush { config } => cmd_flush(&config),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn load_settings(config_path: &Path) -> Result<(Config, Arc<Settings>), String> {
    let cfg = config::load(config_path).map_err(|e| format!("Failed to load config: {}", e))?;
    init_logging(Some(&cfg.logging));
    info!("Loaded {}", config_path.display());
    let settings = Settings::from_config(&cfg).map_err(|e| e.to_string())?;
    Ok((cfg, Arc::new(settings)))
}

async fn open_audit(cfg: &Config) -> Result<AuditLog, String> {
    AuditLog::open(&cfg.audit.session_log, &cfg.audit.history_log)
        .await
        .map_err(|e| e.to_string())
}

fn cmd_run(config_path: &Path, dry_run: bool, events: &str) -> Result<(), String> {
    let (cfg, settings) = load_settings(config_path)?;
    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(async move {
        let audit = open_audit(&cfg).await?;
        if dry_run {
            info!("dry run, no command will touch the system");
            serve(settings, DryRunRunner::new(), audit, events).await
        } else {
            serve(settings, SystemRunner::new(), audit, events).await
        }
    })
}

async fn serve<R: CommandRunner>(
    settings: Arc<Settings>,
    runner: R,
    audit: AuditLog,
    source: &str,
) -> Result<(), String> {
    let (orchestrator, handles) = Orchestrator::new(settings, runner, audit);
    let Handles {
        events,
        control,
        updates,
        metrics,
    } = handles;

    let printer = tokio::spawn(print_updates(updates.subscribe()));
    drop(updates);
    let feed = tokio::spawn(read_feed(source.to_string(), events, control, metrics));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let result = orchestrator.run(shutdown).await;
    feed.abort();
    printer.abort();

    let snapshot = result.map_err(|e| e.to_string())?;
    print_json(&snapshot);
    Ok(())
}

fn cmd_flush(config_path: &Path) -> Result<(), String> {
    let (cfg, settings) = load_settings(config_path)?;
    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(async move {
        let audit = open_audit(&cfg).await?;
        let (mut orchestrator, _handles) = Orchestrator::new(settings, SystemRunner::new(), audit);
        orchestrator.teardown().await;
        info!("flush complete");
        Ok(())
    })
}

fn cmd_config_validate(config_path: &Path) -> Result<(), String> {
    init_logging(None);
    println!("[INFO] Validating {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        Err("Validation failed".to_string())
    } else {
        println!("[INFO] Configuration is valid");
        Ok(())
    }
}

async fn read_feed(
    source: String,
    events: mpsc::Sender<DiscoveryEvent>,
    control: ControlHandle,
    metrics: Arc<Metrics>,
) {
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if source == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        match tokio::fs::File::open(&source).await {
            Ok(file) => Box::new(BufReader::new(file)),
            Err(e) => {
                error!(source = %source, error = %e, "cannot open event feed");
                return;
            }
        }
    };

    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "event feed read failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(command) = FeedCommand::parse(line) {
            match command {
                FeedCommand::Route => {
                    if let Err(e) = control.enable_default_route().await {
                        warn!(error = %e, "route request failed");
                    }
                }
                FeedCommand::Probe => match control.send_discovery_probe().await {
                    Ok(true) => info!("discovery probe sent"),
                    Ok(false) => info!("client unknown, no probe sent"),
                    Err(e) => warn!(error = %e, "probe request failed"),
                },
                FeedCommand::Info => match control.snapshot().await {
                    Ok(snapshot) => print_json(&snapshot),
                    Err(e) => warn!(error = %e, "snapshot request failed"),
                },
                FeedCommand::Quit => {
                    if let Err(e) = control.shutdown().await {
                        warn!(error = %e, "shutdown request failed");
                    }
                    return;
                }
            }
            continue;
        }

        match DiscoveryEvent::from_json(line) {
            Ok(event) => {
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                metrics.events_rejected.inc();
                warn!(error = %e, "rejected feed line");
            }
        }
    }
    info!("event feed finished, the bridge stays up until shutdown");
}

async fn print_updates(mut updates: broadcast::Receiver<BridgeUpdate>) {
    loop {
        match updates.recv().await {
            Ok(update) => print_json(&update),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "notification printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "cannot serialize output"),
    }
}

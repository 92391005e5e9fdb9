use clap::Parser;
use tracing::{error, info};

use bastion::cli::{Cli, Commands};
use bastion::config::AppConfig;
use bastion::error::{BastionError, Result};
use bastion::TradingCore;

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command() {
        Commands::Run => {
            let config = load_config(&cli)?;
            init_logging(&config.logging);
            run(config).await
        }
        Commands::Reconcile { json } => {
            init_logging_simple();
            let config = load_config(&cli)?;
            reconcile(config, json).await
        }
        Commands::CheckConfig => {
            init_logging_simple();
            let config = load_config(&cli)?;
            println!(
                "Configuration OK: {} venue(s), dry_run={}, ledger={}",
                config.venues.len(),
                config.dry_run,
                if config.database.is_some() {
                    "postgres"
                } else {
                    "memory"
                }
            );
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let config = AppConfig::load_from(&cli.config_dir)?;
    if let Err(problems) = config.validate() {
        for problem in &problems {
            eprintln!("config: {}", problem);
        }
        return Err(BastionError::Validation(format!(
            "{} configuration problem(s)",
            problems.len()
        )));
    }
    Ok(config)
}

async fn run(config: AppConfig) -> Result<()> {
    info!(
        "Starting bastion: {} venue(s), dry_run={}",
        config.venues.len(),
        config.dry_run
    );

    let mut core = TradingCore::from_config(config).await?;
    if let Err(e) = core.start().await {
        error!("Startup reconciliation failed: {}", e);
        core.shutdown().await?;
        return Err(e);
    }

    info!("Execution core running; waiting for shutdown signal");
    shutdown_signal().await;
    info!("Shutdown signal received");

    core.shutdown().await
}

async fn reconcile(config: AppConfig, json: bool) -> Result<()> {
    let core = TradingCore::from_config(config).await?;
    let report = core.reconciler().reconcile_once().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "restored={} orphans_flattened={} phantoms_closed={} ghosts_swept={} venues_skipped={:?} escalations={} ({}ms)",
            report.restored,
            report.orphans_flattened,
            report.phantoms_closed,
            report.ghosts_swept,
            report.venues_skipped,
            report.escalations.len(),
            report.duration_ms
        );
        for escalation in &report.escalations {
            println!("  {}", escalation);
        }
    }

    core.shutdown().await
}

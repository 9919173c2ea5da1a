use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobwatch_sync::{MemoryAlertStore, MonitorConfig, PgAlertStore};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "jobwatch")]
#[command(about = "Watch career pages and email new postings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check every active target once.
    Sync,
    /// Extract one target's postings without saving or notifying.
    Check { target_id: Uuid },
    Migrate,
    /// Upsert targets from a YAML file into the database.
    Import { path: PathBuf },
    /// Run the HTTP API, plus the cron scheduler when enabled.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });
            let report = jobwatch_sync::run_batch_once_from_env(&cancel).await?;
            println!(
                "sync complete: targets_checked={} postings_found={} notifications_sent={} cancelled={}",
                report.targets_checked, report.postings_found, report.notifications_sent, report.cancelled
            );
        }
        Commands::Check { target_id } => {
            let config = MonitorConfig::from_env();
            let monitor = jobwatch_sync::build_monitor(&config).await?;
            let report = monitor.dry_run(target_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            let config = MonitorConfig::from_env();
            let store = PgAlertStore::connect(&config.database_url).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Import { path } => {
            let config = MonitorConfig::from_env();
            let file = MemoryAlertStore::from_yaml_file(&path)?;
            let store = PgAlertStore::connect(&config.database_url).await?;
            let targets = file.targets().await;
            for target in &targets {
                store
                    .upsert_target(target)
                    .await
                    .with_context(|| format!("importing target {}", target.id))?;
            }
            println!("imported {} targets from {}", targets.len(), path.display());
        }
        Commands::Serve => {
            jobwatch_web::serve_from_env().await?;
        }
    }

    Ok(())
}

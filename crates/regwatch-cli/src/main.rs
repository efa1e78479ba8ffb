use anyhow::Result;
use clap::{Parser, Subcommand};
use regwatch_sync::SyncConfig;
use regwatch_web::{AppState, WebConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "regwatch")]
#[command(about = "Vehicle registry reconciliation service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Sync,
    Migrate,
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = regwatch_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} fetched={} inserted={} updated={} added={} removed={}",
                summary.run_id,
                summary.fetched,
                summary.inserted,
                summary.updated,
                summary.added,
                summary.removed
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let pool = regwatch_storage::connect(&config.database_url).await?;
            regwatch_storage::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let sync_config = SyncConfig::from_env();
            let web_config = WebConfig::from_env();
            let pool = regwatch_storage::connect(&sync_config.database_url).await?;
            regwatch_storage::run_migrations(&pool).await?;

            if let Some(scheduler) = regwatch_sync::maybe_build_scheduler(&sync_config).await? {
                scheduler
                    .start()
                    .await
                    .map_err(|err| anyhow::anyhow!("scheduler start failed: {err}"))?;
                info!(cron = %sync_config.sync_cron, "sync scheduler started");
            }

            regwatch_web::serve(AppState::new(pool, web_config.api_keys), web_config.port).await?;
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

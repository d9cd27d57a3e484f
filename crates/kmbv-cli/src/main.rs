use anyhow::Result;
use clap::{Parser, Subcommand};
use kmbv_sync::SyncConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kmbv")]
#[command(about = "Synchronize Konzertmeister appointments into the BMV activity register")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass and exit.
    Sync,
    /// Serve the HTTP trigger endpoints.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = kmbv_sync::run_sync_once(&config).await?;
            println!(
                "sync complete: fetched={} skipped={} submitted={}",
                summary.fetched, summary.skipped, summary.submitted
            );
        }
        Commands::Serve => kmbv_web::serve(config).await?,
    }

    Ok(())
}

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scout_engine::{EngineConfig, LlmMatchEngine};
use scout_notify::{SmsGateway, SmsGatewayConfig};
use scout_pipeline::{build_scheduler, Pipeline, PipelineConfig};
use scout_store::PgStore;
use scout_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scout")]
#[command(about = "Saved-search scout: scheduled search and notification pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute one pipeline run (search then notify) and exit.
    Run,
    /// Run the cron scheduler until interrupted.
    Schedule,
    /// Serve the HTTP API.
    Serve,
    /// Apply database migrations.
    Migrate,
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
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = build_pipeline(&config).await?;
            match pipeline.run_once().await? {
                Some(summary) => println!(
                    "run complete: run_id={} processed={} failed={} new_results={} delivered={}",
                    summary.run_id,
                    summary.subscriptions_processed,
                    summary.subscriptions_failed,
                    summary.new_results,
                    summary.sweep.delivered,
                ),
                None => println!("run suppressed: another run is still in progress"),
            }
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                anyhow::bail!("scheduler disabled via SCOUT_SCHEDULER_ENABLED");
            }
            let pipeline = Arc::new(build_pipeline(&config).await?);
            let mut sched = build_scheduler(pipeline, &config.search_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.search_cron, "scheduler started; waiting for shutdown signal");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            let store = connect_store(&config).await?;
            let addr: SocketAddr = std::env::var("SCOUT_WEB_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
                .parse()
                .context("parsing SCOUT_WEB_ADDR")?;
            info!(%addr, "serving API");
            scout_web::serve(AppState::new(store), addr).await?;
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

// A store-connection failure at startup aborts the command; nothing runs
// against an unavailable store.
async fn connect_store(config: &PipelineConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

async fn build_pipeline(config: &PipelineConfig) -> Result<Pipeline> {
    let store = connect_store(config).await?;
    let engine =
        LlmMatchEngine::new(EngineConfig::from_env()).context("building match engine client")?;
    let delivery =
        SmsGateway::new(SmsGatewayConfig::from_env()).context("building sms gateway client")?;
    Ok(Pipeline::new(store, Arc::new(engine), Arc::new(delivery)))
}

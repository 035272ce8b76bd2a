use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use spek_core::{QueryId, SearchParams};
use spek_storage::{MemoryStore, PgStore, QueryRegistry, ResultLedger};
use spek_sync::{Pipeline, RegisterQuery, SyncConfig};
use spek_web::{AppState, WebConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "spek")]
#[command(about = "Watches saved Marktplaats searches and announces new listings")]
struct Cli {
    /// Keep state in memory instead of Postgres; everything is lost on exit.
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// HTTP API plus the periodic sweep.
    Serve,
    /// Run every saved query once.
    Sweep,
    Migrate,
    /// Save a new query from a marketplace URL or explicit filters.
    Add(AddArgs),
    List,
    Get { id: String },
    Run { id: String },
    Delete { id: String },
}

#[derive(Debug, Args)]
struct AddArgs {
    /// Search URL copied from the marketplace; takes precedence over the filters.
    #[arg(long)]
    url: Option<String>,
    #[arg(long, default_value = "")]
    query: String,
    #[arg(long)]
    category: Option<u32>,
    #[arg(long)]
    sub_category: Option<u32>,
    #[arg(long, default_value = "")]
    postcode: String,
    #[arg(long)]
    distance_meters: Option<u32>,
    #[arg(long = "attribute")]
    attributes_by_id: Vec<u32>,
    #[arg(long)]
    include_commercials: bool,
}

impl From<AddArgs> for RegisterQuery {
    fn from(args: AddArgs) -> Self {
        RegisterQuery {
            query_url: args.url,
            query: SearchParams {
                query: args.query,
                category: args.category,
                sub_category: args.sub_category,
                postcode: args.postcode,
                distance_meters: args.distance_meters,
                attributes_by_id: args.attributes_by_id,
                include_commercials: args.include_commercials,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Migrate => {
            if cli.memory {
                warn!("in-memory store has no migrations");
                return Ok(());
            }
            connect_postgres(&config).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let (registry, ledger) = open_store(cli.memory, &config).await?;
            let pipeline = Pipeline::new(config, registry, ledger).await?;
            let scheduler = pipeline.maybe_start_scheduler().await?;

            let web = WebConfig::from_env();
            let mut state = AppState::new(pipeline.runner());
            if let Some(identity) = web
                .identity_client()
                .context("configuring the identity client")?
            {
                state = state.with_identity(identity);
            }
            spek_web::serve(state, web.port).await?;

            if let Some(mut scheduler) = scheduler {
                scheduler
                    .shutdown()
                    .await
                    .context("stopping the sweep scheduler")?;
            }
            pipeline.shutdown().await;
        }
        Commands::Sweep => {
            let (registry, ledger) = open_store(cli.memory, &config).await?;
            let pipeline = Pipeline::new(config, registry, ledger).await?;
            let summary = pipeline.sweep_once().await?;
            pipeline.shutdown().await;
            print_json(&summary)?;
        }
        Commands::Add(args) => {
            let pipeline = pipeline(cli.memory, config).await?;
            let query = pipeline.runner().register(args.into()).await?;
            print_json(&query)?;
        }
        Commands::List => {
            let pipeline = pipeline(cli.memory, config).await?;
            print_json(&pipeline.runner().list().await?)?;
        }
        Commands::Get { id } => {
            let pipeline = pipeline(cli.memory, config).await?;
            print_json(&pipeline.runner().get(&QueryId::from(id)).await?)?;
        }
        Commands::Run { id } => {
            let pipeline = pipeline(cli.memory, config).await?;
            let outcome = pipeline.runner().run(&QueryId::from(id)).await?;
            pipeline.shutdown().await;
            print_json(&outcome.new_listings)?;
        }
        Commands::Delete { id } => {
            let pipeline = pipeline(cli.memory, config).await?;
            pipeline.runner().delete(&QueryId::from(id.clone())).await?;
            println!("deleted {id}");
        }
    }

    Ok(())
}

async fn pipeline(memory: bool, config: SyncConfig) -> Result<Pipeline> {
    let (registry, ledger) = open_store(memory, &config).await?;
    Pipeline::new(config, registry, ledger).await
}

async fn open_store(
    memory: bool,
    config: &SyncConfig,
) -> Result<(Arc<dyn QueryRegistry>, Arc<dyn ResultLedger>)> {
    if memory {
        info!("using in-memory store");
        let store = Arc::new(MemoryStore::new());
        let registry: Arc<dyn QueryRegistry> = store.clone();
        let ledger: Arc<dyn ResultLedger> = store;
        return Ok((registry, ledger));
    }
    let store = Arc::new(connect_postgres(config).await?);
    let registry: Arc<dyn QueryRegistry> = store.clone();
    let ledger: Arc<dyn ResultLedger> = store;
    Ok((registry, ledger))
}

async fn connect_postgres(config: &SyncConfig) -> Result<PgStore> {
    let store = PgStore::connect(&config.database_url, 10)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{text}");
    Ok(())
}

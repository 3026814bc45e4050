use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use spinsearch::api::{AppState, build_router};
use spinsearch::harvest::{self, HarvestOptions, Harvester};
use spinsearch::{AppConfig, IndexManager, IndexName, MemoryGateway, SearchService, SharedGateway};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::prelude::*;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Args {
    /// Config file, defaults to ./app.toml when present
    #[clap(long, env = "APP_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum HarvestTarget {
    Spins,
    Epf,
    /// Apply index settings and mappings without loading data
    Settings,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a relational source into its index
    Harvest {
        #[clap(value_enum)]
        target: HarvestTarget,
        /// Concurrent workers
        forks: Option<usize>,
        /// Total document cap
        limit: Option<u64>,
        /// Rows per batch
        batch_size: Option<u64>,
        /// Delete and recreate the index first
        #[clap(long)]
        reset: bool,
    },
    /// Serve the search API
    Serve {
        #[clap(long)]
        bind: Option<String>,
        /// Use an in-process engine instead of the configured one
        #[clap(long)]
        memory: bool,
    },
}

fn engine_gateway(config: &AppConfig) -> Result<SharedGateway> {
    spinsearch::create_gateway(&config.engine).context("Failed to create search engine gateway")
}

async fn run_harvest(
    config: &AppConfig,
    target: HarvestTarget,
    forks: Option<usize>,
    limit: Option<u64>,
    batch_size: Option<u64>,
    reset: bool,
) -> Result<()> {
    let manager = IndexManager::from_config(engine_gateway(config)?, config);
    let index = match target {
        HarvestTarget::Spins => IndexName::Spins,
        HarvestTarget::Epf => IndexName::Epf,
        HarvestTarget::Settings => {
            for index in IndexName::ALL {
                if reset {
                    manager.reset(index).await?;
                } else {
                    manager.apply_settings(index).await?;
                }
            }
            tracing::info!("Index settings applied");
            return Ok(());
        }
    };

    let source = harvest::mysql_source(config, index)?;
    let mut options = HarvestOptions::from_config(config);
    options.forks = forks.unwrap_or(options.forks);
    options.limit = limit;
    options.batch_size = batch_size;
    options.reset = reset;

    let report = Harvester::new(manager, source)
        .run(&options)
        .await
        .with_context(|| format!("Harvest of '{}' failed", index))?;
    println!("{}", report);
    Ok(())
}

async fn serve(config: &AppConfig, bind: Option<String>, memory: bool) -> Result<()> {
    let search = if memory {
        tracing::warn!("Serving from an in-memory engine; nothing is persisted");
        SearchService::new(Arc::new(MemoryGateway::with_schemas()), config.engine.timeout_secs)
    } else {
        spinsearch::create_search_service(&config.engine)
            .context("Failed to create search service")?
    };
    let router = build_router(AppState::new(search));

    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind '{}'", bind))?;
    tracing::info!("Listening on {}", bind);
    axum::serve(listener, router).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // let trace max level configurable (default to info)
    let trace_max_level = std::env::var("TRACE_MAX_LEVEL")
        .unwrap_or_else(|_| "info".to_string())
        .parse()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(trace_max_level)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive("spinsearch=info".parse()?)
                .from_env_lossy(),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish()
        .init();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref()).context("Failed to load config")?;

    match args.command {
        Commands::Harvest {
            target,
            forks,
            limit,
            batch_size,
            reset,
        } => run_harvest(&config, target, forks, limit, batch_size, reset).await,
        Commands::Serve { bind, memory } => serve(&config, bind, memory).await,
    }
}

//! # GridFire Server
//!
//! Runs the HTTP API, the pipeline workers, or both.
//!
//! - `gridfire-server serve` (default): API plus embedded workers
//! - `gridfire-server worker`: workers only, sharing the Postgres queue
//! - `gridfire-server migrate`: apply database migrations and exit

use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use gridfire_config::{Config, ConfigLoad, ConfigLoader};
use gridfire_core::{WorkerPool, notify::relay_notifications};
use gridfire_server::{
    AppState,
    infra::startup::{self, Services},
    routes,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "gridfire-server")]
#[command(about = "Audio ingestion, transcoding and streaming for GridFire")]
struct Cli {
    /// Path to a TOML config file (defaults to gridfire.toml or $GRIDFIRE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file to load before reading the environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API (default)
    Serve(ServeArgs),
    /// Run pipeline workers without the HTTP API
    Worker,
    /// Apply database migrations and exit
    Migrate,
}

#[derive(ClapArgs, Debug, Clone, Default)]
struct ServeArgs {
    /// Server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Do not run pipeline workers in this process
    #[arg(long, default_value_t = false)]
    no_workers: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => run_server(config, args).await,
        Command::Worker => run_workers(config).await,
        Command::Migrate => run_migrate(config).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &cli.env_file {
        loader = loader.with_env_file(path);
    }
    let ConfigLoad { config, warnings } =
        loader.load().context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "loaded config file");
    }
    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    for warning in warnings.iter() {
        match &warning.hint {
            Some(hint) => warn!(hint = %hint, "{}", warning.message),
            None => warn!("{}", warning.message),
        }
    }
    Ok(config)
}

async fn run_migrate(config: Config) -> anyhow::Result<()> {
    let pool = startup::connect_database(&config).await?;
    startup::run_migrations(&pool).await?;
    pool.close().await;
    Ok(())
}

async fn run_workers(config: Config) -> anyhow::Result<()> {
    if config.database.url.is_none() {
        anyhow::bail!(
            "worker mode needs DATABASE_URL; in-memory jobs are only visible to `serve`"
        );
    }
    if config.redis.is_none() {
        warn!("no Redis configured; progress events from this worker will not reach clients");
    }

    let cancel = CancellationToken::new();
    let services = startup::build_services(&config).await?;
    let pool = WorkerPool::spawn(
        services.pipeline.clone(),
        startup::worker_settings(&config.worker),
        cancel.clone(),
    );

    startup::shutdown_signal(cancel.clone()).await;
    info!("shutting down workers; waiting for running jobs");
    pool.join().await;
    close(services).await;
    Ok(())
}

async fn run_server(mut config: Config, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    let cancel = CancellationToken::new();
    let services = startup::build_services(&config).await?;
    let state = AppState::new(
        services.pipeline.clone(),
        services.hub.clone(),
        config.server.max_upload_bytes,
    )
    .with_shutdown(cancel.clone());

    let relay = config.redis.as_ref().map(|redis| {
        tokio::spawn(relay_notifications(
            redis.url.clone(),
            redis.channel.clone(),
            services.hub.clone(),
            cancel.clone(),
        ))
    });

    let workers = if args.no_workers {
        if !services.is_durable() {
            warn!("workers disabled with in-memory state; uploaded tracks will never be processed");
        }
        None
    } else {
        Some(WorkerPool::spawn(
            services.pipeline.clone(),
            startup::worker_settings(&config.worker),
            cancel.clone(),
        ))
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let readiness = state.readiness.clone();
    let app = routes::create_router(state);
    readiness.mark_ready();
    info!(%addr, "GridFire server listening");

    let signal = {
        let cancel = cancel.clone();
        let readiness = readiness.clone();
        async move {
            startup::shutdown_signal(cancel).await;
            readiness.mark_draining();
            info!("shutting down; draining connections");
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .context("server error")?;

    cancel.cancel();
    if let Some(workers) = workers {
        info!("waiting for running jobs");
        workers.join().await;
    }
    if let Some(relay) = relay
        && let Err(err) = relay.await
    {
        warn!(error = %err, "notification relay task failed");
    }
    close(services).await;
    info!("shutdown complete");
    Ok(())
}

async fn close(services: Services) {
    if let Some(pool) = services.pool {
        pool.close().await;
    }
}

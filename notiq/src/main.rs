use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use notiq::api::{ApiServer, AppState};
use notiq::broker::Connector;
use notiq::broker::memory::MemoryBroker;
use notiq::broker::redis_streams::RedisConnector;
use notiq::config::AppConfig;
use notiq::logging::init_logging;
use notiq::notifier::EmailNotifier;
use notiq::producer::Producer;
use notiq::worker::ConsumerLoop;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Load environment variables from this file instead of `./.env`
    #[arg(long, env = "NOTIQ_ENV_FILE")]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Accept notifications over HTTP and enqueue them
    Api,
    /// Consume the queue and deliver notifications
    Worker,
    /// Run the API and a worker in one process
    Standalone,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    match &args.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("Failed to load env file {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let config = AppConfig::from_env();
    let _log_guard = init_logging(&config.logging)?;

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted by user, shutting down...");
            token.cancel();
        }
    });

    info!(
        command = ?args.command,
        broker = %config.broker.display_location(),
        queue = %config.broker.queue,
        "Starting notiq"
    );

    match args.command {
        Command::Api | Command::Worker if config.broker.is_memory() => {
            anyhow::bail!("the in-memory broker is only available with `notiq standalone`")
        }
        Command::Api => {
            let connector = RedisConnector::new(config.broker.clone());
            serve_api(&config, connector, shutdown).await
        }
        Command::Worker => {
            let connector = RedisConnector::new(config.broker.clone());
            consume(&config, connector, shutdown).await
        }
        Command::Standalone if config.broker.is_memory() => {
            standalone(&config, MemoryBroker::new(), shutdown).await
        }
        Command::Standalone => {
            let connector = RedisConnector::new(config.broker.clone());
            standalone(&config, connector, shutdown).await
        }
    }
}

async fn serve_api<C>(
    config: &AppConfig,
    connector: C,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    C: Connector + Clone + 'static,
{
    let producer = Producer::new(connector, config.broker.queue.clone());
    let state = AppState::new(Arc::new(producer));

    ApiServer::new(config.api.clone(), state)
        .with_cancel_token(shutdown)
        .run()
        .await
        .context("API server failed")
}

async fn consume<C>(
    config: &AppConfig,
    connector: C,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    C: Connector + 'static,
{
    let notifier = EmailNotifier::new(config.email.clone()).context("Invalid SMTP settings")?;
    if !notifier.is_configured() {
        warn!("SMTP credentials not set, high-priority notifications will only be logged");
    }

    let consumer = ConsumerLoop::new(
        connector,
        config.broker.queue.clone(),
        notifier,
        config.consumer.clone(),
    );
    let stats = consumer.run(shutdown).await.context("Worker failed")?;
    info!(
        received = stats.received,
        acknowledged = stats.acknowledged,
        "Worker finished"
    );
    Ok(())
}

async fn standalone<C>(
    config: &AppConfig,
    connector: C,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    C: Connector + Clone + 'static,
{
    let api = serve_api(config, connector.clone(), shutdown.clone());
    // A worker that stops, cleanly or not, takes the API down with it.
    let worker = async {
        let result = consume(config, connector, shutdown.clone()).await;
        shutdown.cancel();
        result
    };

    tokio::try_join!(worker, api)?;
    Ok(())
}

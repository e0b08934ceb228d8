//! Energy metering ingest API - main entry point

use meter_ingest::config::{load_env_file, IngestConfig, DEFAULT_ENV_FILES};
use meter_ingest::context::CallContext;
use meter_ingest::http::{ApiState, HttpServer};
use meter_ingest::observability::logging::{
    init_default_logging, init_logging, parse_spans_flag, LogFormat,
};
use meter_ingest::service::IngestService;
use meter_ingest::transport::amqp::{LapinBroker, Publisher};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn, Level};

const DEFAULT_CONFIG_PATHS: &[&str] = &["meter-ingest.toml", "config/meter-ingest.toml"];

/// Energy metering ingest API
#[derive(Parser)]
#[command(name = "meter-ingest")]
#[command(about = "Accepts meter readings over HTTP and publishes them to RabbitMQ")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingest service
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let env_file = load_env_file(DEFAULT_ENV_FILES);
    init_cli_logging(cli.verbose);

    info!("Starting meter-ingest v{}", env!("CARGO_PKG_VERSION"));
    match env_file {
        Some(path) => info!("Loaded .env file from: {}", path.display()),
        None => info!("No .env file found, using system environment variables"),
    }

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_service(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn init_cli_logging(verbose: u8) {
    let level = match verbose {
        0 => return init_default_logging(),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
    let spans = parse_spans_flag(&std::env::var("LOG_SPANS").unwrap_or_default());
    init_logging(level, format, spans);
}

/// Explicit file, else the first default location that exists, else environment only
fn load_configuration(
    config_path: Option<&Path>,
) -> Result<IngestConfig, Box<dyn std::error::Error + Send + Sync>> {
    let path = match config_path {
        Some(path) => Some(path.to_path_buf()),
        None => DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()),
    };

    match &path {
        Some(path) => info!("Loading configuration from: {}", path.display()),
        None => info!("No configuration file found, using environment variables"),
    }
    Ok(IngestConfig::load(path.as_deref())?)
}

async fn run_service(config: IngestConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let shown = config.redacted();
    info!(
        service = %shown.service.name,
        port = shown.service.port,
        broker = %shown.rabbitmq.url,
        exchange = %shown.rabbitmq.exchange,
        routing_key = %shown.rabbitmq.routing_key,
        "Configuration loaded"
    );

    let broker = LapinBroker::new(&config.rabbitmq.url, &config.service.name)?;
    let start_timeout = config.start_timeout();
    let startup = CallContext::new().with_timeout(start_timeout);
    let publisher =
        match Publisher::connect_within(broker, config.publisher_settings(), &startup).await {
            Ok(publisher) => Arc::new(publisher),
            Err(e) if e.is_cancelled() => {
                return Err(
                    format!("Broker connection not established within {start_timeout:?}").into(),
                )
            }
            Err(e) => return Err(e.into()),
        };

    let service = IngestService::new(publisher.clone(), config.rabbitmq.routing_key.clone());
    let state = Arc::new(ApiState::new(
        service,
        config.service.name.clone(),
        config.request_timeout(),
    ));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.service.port));
    let mut server = HttpServer::start(state, addr)?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(addr = %server.local_addr(), "Service is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        exited = server.stopped() => {
            match exited {
                Ok(()) => error!("HTTP server exited unexpectedly, shutting down..."),
                Err(e) => error!("HTTP server task failed: {}, shutting down...", e),
            }
        }
    }

    let stop_timeout = config.stop_timeout();
    let stop_deadline = Instant::now() + stop_timeout;

    if let Err(e) = server.shutdown(stop_timeout).await {
        warn!("HTTP server shutdown: {}", e);
    }

    let remaining = stop_deadline.saturating_duration_since(Instant::now());
    match timeout(remaining, publisher.close()).await {
        Ok(Ok(())) => info!("Publisher closed"),
        Ok(Err(e)) => error!("RabbitMQ publisher close error: {}", e),
        Err(_) => warn!("Publisher close did not finish within the stop timeout"),
    }

    Ok(())
}

fn handle_config_command(
    config: &IngestConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if show {
        println!("Current configuration:");
        println!("{}", config.to_redacted_toml()?);
    }

    info!("Configuration validation complete");
    Ok(())
}

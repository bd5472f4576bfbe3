use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use freeswitch_restxml::{load_config, validate_config, ConfigError, ElementRegistry, OutboundConfig, OutboundServer};

#[derive(Parser)]
#[command(name = "freeswitch-restxml")]
#[command(about = "Outbound FreeSWITCH event socket server for RESTXML call flows", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(short, long)]
    listen: Option<String>,

    /// Answer URL for inbound calls without one, overrides the config file
    #[arg(long)]
    default_answer_url: Option<String>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long)]
    debug: bool,
}

fn resolve_config(cli: &Cli) -> Result<OutboundConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => OutboundConfig::default(),
    };
    if let Some(listen) = &cli.listen {
        config.listen = listen.clone();
    }
    if let Some(url) = &cli.default_answer_url {
        config.default_answer_url = Some(url.clone());
    }
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "freeswitch_restxml=debug"
    } else {
        "freeswitch_restxml=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = resolve_config(&cli)?;
    tracing::info!(
        listen = %config.listen,
        default_answer_url = ?config.default_answer_url,
        method = %config.default_http_method,
        "Configuration loaded"
    );

    let fetcher = config.fetcher()?;
    let server = OutboundServer::new(config.session_config(), Arc::new(fetcher), ElementRegistry::builtin());

    let listener = TcpListener::bind(&config.listen).await?;
    server
        .serve_with_shutdown(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    tracing::info!("freeswitch-restxml stopped");
    Ok(())
}

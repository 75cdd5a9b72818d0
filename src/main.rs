use admission::config::Config;
use admission::server::Server;
use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Request admission service: rate limiting and idempotent execution.
#[derive(Debug, Parser)]
#[command(name = "admission", version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "ADMISSION_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "BIND_ADDR")]
    bind_addr: Option<SocketAddr>,

    /// Redis connection URL; the in-memory store is used without one
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())
            .context("Failed to load configuration")?;

        if let Some(bind_addr) = self.bind_addr {
            config.bind_addr = bind_addr;
        }
        if let Some(redis_url) = self.redis_url {
            config.redis_url = Some(redis_url);
        }
        if let Some(log_level) = self.log_level {
            config.log_level = log_level;
        }

        config.validated().context("Invalid configuration")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Cli::parse().into_config()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("admission={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting admission service");
    tracing::info!(
        "Configuration: bind_addr={}, store={}, algorithm={}",
        config.bind_addr,
        if config.redis_url.is_some() { "redis" } else { "memory" },
        config.admission.algorithm
    );

    let server = Server::new(config).context("Failed to create server")?;
    server.run().await.context("Server error")?;

    Ok(())
}

//! Keel API Server

use anyhow::Context;
use clap::Parser;
use keel_api::{AppState, routes};
use keel_config::{LogFormat, QueueDriver, RouteFallback, SecretsDriver, ServerConfig};
use keel_db::{PoolSettings, create_pool, run_migrations};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keel-server")]
#[command(about = "Keel build dispatch server", long_about = None)]
struct Args {
    /// Path to a KDL configuration file
    #[arg(short, long, env = "KEEL_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "KEEL_ADDR")]
    addr: Option<String>,

    /// Log output format (text or json)
    #[arg(long, env = "KEEL_LOG_FORMAT")]
    log_format: Option<String>,

    /// Database URL (postgres://... or sqlite:...)
    #[arg(long, env = "KEEL_DATABASE_URL")]
    database_url: Option<String>,

    /// Queue driver (memory or database)
    #[arg(long, env = "KEEL_QUEUE_DRIVER")]
    queue_driver: Option<String>,

    /// Run as one node of a cluster sharing the queue broker
    #[arg(long, env = "KEEL_QUEUE_CLUSTER")]
    cluster: bool,

    /// Worker routes in addition to the default route
    #[arg(long = "route", env = "KEEL_QUEUE_ROUTES", value_delimiter = ',')]
    routes: Vec<String>,

    /// What to do with unconfigured routes (default or reject)
    #[arg(long, env = "KEEL_QUEUE_FALLBACK")]
    fallback: Option<String>,

    /// Secrets driver (memory or vault)
    #[arg(long, env = "KEEL_SECRETS_DRIVER")]
    secrets_driver: Option<String>,

    /// Vault address
    #[arg(long, env = "KEEL_VAULT_ADDR")]
    vault_addr: Option<String>,

    /// Vault token
    #[arg(long, env = "KEEL_VAULT_TOKEN", hide_env_values = true)]
    vault_token: Option<String>,
}

impl Args {
    /// Load the configuration file, if any, and apply command line overrides.
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(addr) = self.addr {
            config.server.addr = addr;
        }
        if let Some(format) = self.log_format {
            config.server.log_format = format.parse::<LogFormat>()?;
        }
        if let Some(url) = self.database_url {
            config.database.url = url;
        }
        if let Some(driver) = self.queue_driver {
            config.queue.driver = driver.parse::<QueueDriver>()?;
        }
        if self.cluster {
            config.queue.cluster = true;
        }
        if !self.routes.is_empty() {
            config.queue.routes.extend(self.routes);
        }
        if let Some(fallback) = self.fallback {
            config.queue.fallback = fallback.parse::<RouteFallback>()?;
        }
        if let Some(driver) = self.secrets_driver {
            config.secrets.driver = driver.parse::<SecretsDriver>()?;
        }
        if self.vault_addr.is_some() {
            config.secrets.addr = self.vault_addr;
        }
        if self.vault_token.is_some() {
            config.secrets.token = self.vault_token;
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;

    init_tracing(config.server.log_format);
    init_metrics();

    // Create database pool
    info!("Connecting to database...");
    let settings = PoolSettings {
        max_connections: config.database.max_connections,
        min_connections: config.database.min_connections,
        max_lifetime: Some(config.database.connection_life),
    };
    let db = create_pool(&config.database.url, &settings).await?;
    run_migrations(&db).await?;
    info!(dialect = ?db.dialect(), "Database connected");

    // Create app state
    let state = AppState::new(db, &config)?;

    // Build router
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server
    info!("Starting server on {}", config.server.addr);

    let listener = TcpListener::bind(&config.server.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

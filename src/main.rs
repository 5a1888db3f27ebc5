use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::config::{FloodgateConfig, LogFormat, LoggingConfig, StoreBackend};
use floodgate::http::{AppState, HttpServer};
use floodgate::ratelimit::{InMemoryStore, RateLimiter, RedisStore, WindowStore};

/// HTTP request gate with per-client fixed-window rate limiting.
#[derive(Parser, Debug)]
#[command(name = "floodgate", version)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Invalid configuration is fatal before anything starts listening
    let config = FloodgateConfig::load(args.config.as_deref())?;

    init_tracing(&config.logging);

    info!("Starting Floodgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        environment = %config.environment,
        window_secs = config.rate_limiting.window_secs,
        max_requests = config.rate_limiting.max_requests,
        trust_proxy = config.server.trust_proxy,
        "Configuration loaded"
    );

    let store = build_store(&config)?;
    let rate_limiter = RateLimiter::new(store, config.rate_limiting.policy());
    info!("Rate limiter initialized");

    let addr = config.server.listen_addr()?;
    let state = Arc::new(AppState::new(rate_limiter, &config));
    let server = HttpServer::new(addr, state);

    info!("Starting HTTP server on {}", addr);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Floodgate stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn build_store(config: &FloodgateConfig) -> anyhow::Result<Arc<dyn WindowStore>> {
    match config.store.backend {
        StoreBackend::Redis => {
            let store = RedisStore::new(
                &config.store.redis_url,
                config.store.connect_timeout(),
                config.store.command_timeout(),
            )?;
            info!(store = ?store, "Using Redis counter store");
            Ok(Arc::new(store) as Arc<dyn WindowStore>)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory counter store; limits are not shared between instances");
            let store = Arc::new(InMemoryStore::new());
            spawn_purge_task(
                store.clone(),
                Duration::from_secs(config.rate_limiting.window_secs),
            );
            Ok(store as Arc<dyn WindowStore>)
        }
    }
}

/// Periodically drop expired in-memory counters.
fn spawn_purge_task(store: Arc<InMemoryStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            store.purge_expired();
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use rategate::config::{LogFormat, RateGateConfig};
use rategate::http::{router, GateSettings, HttpServer, Upstream};
use rategate::ratelimit::{RateLimiter, StoreMode, WindowStore};
use rategate::store::RedisStore;

/// Sliding window rate limiting gate for the platform API.
#[derive(Debug, Parser)]
#[command(name = "rategate", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `server.listen_addr`
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override `logging.format`
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = RateGateConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config.logging.level, config.logging.format);

    info!("Starting Rategate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    config.validate()?;
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    let primary: Option<Arc<dyn WindowStore>> = if config.store.enabled {
        let store = RedisStore::new(&config.store)?;
        info!(store = %store.display_url(), "Shared store configured");
        Some(Arc::new(store))
    } else {
        info!("Shared store disabled, counting in-process");
        None
    };

    let limiter = Arc::new(RateLimiter::new(
        config.rule_table()?,
        config.classifier(),
        primary,
        config.limiter_options(),
    )?);

    match limiter.probe().await {
        StoreMode::Degraded => warn!("Shared store unreachable at startup, counting in-process"),
        mode => info!(mode = ?mode, "Rate limiter initialized"),
    }

    let maintenance = spawn_maintenance(
        limiter.clone(),
        Duration::from_secs(config.rate_limits.purge_interval_secs),
    );

    let upstream = Arc::new(Upstream::from_config(&config.server)?);
    info!(upstream = %upstream.base_url(), "Forwarding admitted requests");
    let settings = GateSettings {
        enabled: config.rate_limits.enabled,
        trusted_proxies: config.server.trusted_proxies.clone(),
    };
    if !settings.enabled {
        warn!("Rate limiting disabled, forwarding all requests");
    }

    let server = HttpServer::new(config.server.listen_addr, router(limiter, upstream, settings));
    server.serve_with_shutdown(shutdown_signal()).await?;

    maintenance.abort();
    info!("Rategate stopped");
    Ok(())
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
    }
}

/// Periodically sweep the fallback store and, while degraded, re-probe the
/// shared store so recovery doesn't wait on request traffic.
fn spawn_maintenance(limiter: Arc<RateLimiter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if limiter.mode() == StoreMode::Degraded {
                let mode = limiter.probe().await;
                debug!(mode = ?mode, "Probed shared store");
            }

            let removed = limiter.purge_fallback(Utc::now());
            debug!(
                removed,
                buckets = limiter.fallback().bucket_count(),
                "Fallback store sweep complete"
            );
        }
    })
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

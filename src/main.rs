//! uptrail - website uptime, TLS and domain expiry monitor.

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use uptrail::config::MonitorConfig;
use uptrail::db::{MonitorStore, SqliteStore};
use uptrail::inspect::{NetworkInspector, RdapClient, TcpWhoisTransport, WhoisGateway};
use uptrail::monitor::{BroadcastSink, Monitor, MonitorEvent};
use uptrail::probe::NetworkProber;
use uptrail::scheduler::Worker;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("uptrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = MonitorConfig::load();
    tracing::info!("Starting uptrail...");
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(SqliteStore::new(&cfg.db_path)?);
    let targets = store.list_targets().await?;
    tracing::info!("Database initialized successfully ({} targets)", targets.len());

    // Asset inspectors share one WHOIS gateway
    let whois = WhoisGateway::new(
        Arc::new(TcpWhoisTransport::new(cfg.whois_timeout)),
        cfg.whois_rate_limit,
        cfg.whois_cache_ttl,
    );
    let rdap = RdapClient::new(&cfg.rdap_base_url, cfg.rdap_timeout)?;
    let inspector = Arc::new(NetworkInspector::new(whois, rdap, cfg.tls_timeout));

    let sink = Arc::new(BroadcastSink::new(EVENT_CHANNEL_CAPACITY));
    tokio::spawn(log_events(sink.subscribe()));

    let monitor = Monitor::new(store, Arc::new(NetworkProber), inspector, sink);
    let worker = Worker::new(monitor, &cfg)?;

    worker.run(shutdown_signal()).await;

    Ok(())
}

/// Debug-level trace of everything the monitor publishes.
async fn log_events(mut rx: tokio::sync::broadcast::Receiver<MonitorEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::debug!("event {}", json),
                Err(e) => tracing::warn!("Failed to encode {} event: {}", event.name(), e),
            },
            Err(RecvError::Lagged(n)) => tracing::warn!("Event logger lagged, dropped {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

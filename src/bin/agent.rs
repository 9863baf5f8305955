//! comanda-agent: on-device sync daemon
//!
//! Serves the local UI API and keeps the device's tabs in sync with the
//! remote authority in the background.

use chrono::Utc;
use clap::Parser;
use comanda_sync::cli::AgentArgs;
use comanda_sync::config::SyncConfig;
use comanda_sync::connectivity::ConnectivityMonitor;
use comanda_sync::remote::{HttpAuthority, RemoteAuthority};
use comanda_sync::store::LocalStore;
use comanda_sync::sync::{RealtimeMergeListener, SyncEngine};
use comanda_sync::{create_router, TabService};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const RETENTION_SWEEP: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() {
    let args = AgentArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("[agent] Starting comanda-agent for tenant {}", args.tenant);

    let config = match &args.config {
        Some(path) => match SyncConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("[agent] Failed to load config {:?}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => SyncConfig::default(),
    };

    tracing::info!("[agent] Database: {:?}", args.database);
    let store = match LocalStore::open(&args.database) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("[agent] Failed to open database: {}", e);
            std::process::exit(1);
        }
    };
    match store.pending_sync_count() {
        Ok(0) => {}
        Ok(n) => tracing::info!("[agent] Resuming with {} unsent mutations", n),
        Err(e) => tracing::warn!("[agent] Could not count pending mutations: {}", e),
    }

    let authority = match HttpAuthority::new(&args.authority, config.request_timeout()) {
        Ok(authority) => Arc::new(authority),
        Err(e) => {
            tracing::error!("[agent] Failed to set up authority client: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("[agent] Authority: {}", args.authority);

    let connectivity = Arc::new(ConnectivityMonitor::new(false));
    let probe_authority = Arc::clone(&authority);
    let probe = connectivity.spawn_probe(config.probe_interval(), move || {
        let authority = Arc::clone(&probe_authority);
        async move { authority.probe().await }
    });

    let remote: Arc<dyn RemoteAuthority> = authority;
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&store),
        Arc::clone(&remote),
        Arc::clone(&connectivity),
        config.clone(),
    ));
    let listener = Arc::new(RealtimeMergeListener::new(
        Arc::clone(&store),
        remote,
        Arc::clone(&connectivity),
        args.tenant.clone(),
        config.clone(),
    ));

    let service = TabService::new(
        Arc::clone(&store),
        Arc::clone(&connectivity),
        engine.progress(),
        args.tenant.clone(),
        config.stall_after_attempts,
    );

    let engine_handle = tokio::spawn(Arc::clone(&engine).run());
    let listener_handle = tokio::spawn(listener.run());
    let retention_handle = config.retention().map(|retention| {
        let store = Arc::clone(&store);
        let tenant = args.tenant.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETENTION_SWEEP);
            loop {
                ticker.tick().await;
                if let Err(e) = store.purge_settled_before(&tenant, Utc::now() - retention) {
                    tracing::warn!("[agent] Retention sweep failed: {}", e);
                }
            }
        })
    });

    let addr = format!("127.0.0.1:{}", args.port);
    let tcp = match tokio::net::TcpListener::bind(&addr).await {
        Ok(tcp) => tcp,
        Err(e) => {
            tracing::error!("[agent] Cannot bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("[agent] Local API listening on {}", addr);

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(tcp, create_router(service)).await {
            tracing::error!("[agent] Server error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("[agent] Received Ctrl+C");
        }
    }

    // Anything unsent stays in the queue for the next start
    server.abort();
    engine_handle.abort();
    listener_handle.abort();
    probe.abort();
    if let Some(handle) = retention_handle {
        handle.abort();
    }
    tracing::info!("[agent] Shutdown complete");
}

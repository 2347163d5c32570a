//! cubeq server
//!
//! Accepts cube queries over HTTP and answers them from an
//! Elasticsearch-style search backend, or from records posted with the query.

use anyhow::Context;
use cubeq_engine::Qb;
use cubeq_es::{EsQuery, HttpBackend};
use cubeq_server::{logging, router, AppState, Config, Metrics};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let path = std::env::var("CUBEQ_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let config = Config::load(&path).with_context(|| format!("loading {path}"))?;
    logging::init(&config.logging)?;

    let backend = HttpBackend::new(config.backend.url.clone(), config.backend.timeout())?;
    let qb = Qb::new(Default::default()).with_yield_every(config.execution.yield_every);
    let es = EsQuery::new(Arc::new(backend), qb, config.backend.es_settings());
    let state = Arc::new(AppState::new(es, Metrics::new()?));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, backend = %config.backend.url, "cubeq server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler installation failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler installation failed");
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
    info!("Shutdown signal received");
}

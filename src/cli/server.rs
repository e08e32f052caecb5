use crate::cli::{exit_config_not_found, shutdown_signal, Role};
use crate::config::parse::{load_server_config, ConfigError};
use crate::config::types::ServerConfig;
use crate::server::api::IngestState;
use crate::server::parser::JsonParser;
use crate::server::router::{build_router, serve, serve_tls};
use crate::server::tls::{load_server_tls, ServerTlsError};
use crate::storage::duckdb::DuckDbStorage;
use crate::storage::traits::{LogStore, StorageError};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("TLS error: {0}")]
    Tls(#[from] ServerTlsError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(config_path) = config_path else {
        exit_config_not_found(Role::Server);
    };

    info!(config_path = %config_path.display(), "Loading server configuration");
    let config = load_server_config(&config_path)?;
    run_server(config, shutdown_signal()).await?;
    Ok(())
}

/// Load TLS material, open storage, bind the listener and serve until
/// `shutdown` resolves.
pub async fn run_server(
    config: ServerConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ServerError> {
    let tls = match &config.tls {
        Some(tls) => Some(load_server_tls(tls)?),
        None => {
            warn!("No tls block configured, serving plaintext HTTP");
            None
        }
    };
    let store: Arc<dyn LogStore> = Arc::new(DuckDbStorage::open(&config.storage)?);
    let listener = TcpListener::bind(&config.server.listen)
        .await
        .map_err(|source| ServerError::Bind {
            addr: config.server.listen.clone(),
            source,
        })?;
    serve_with_store(&config, store, listener, tls, shutdown).await
}

/// Serve ingestion on `listener` backed by `store`, over TLS when `tls` is
/// set. Open requests get `shutdown_timeout` to finish once `shutdown`
/// resolves; storage is closed last.
pub async fn serve_with_store(
    config: &ServerConfig,
    store: Arc<dyn LogStore>,
    listener: TcpListener,
    tls: Option<Arc<rustls::ServerConfig>>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ServerError> {
    let state = Arc::new(IngestState {
        store: Arc::clone(&store),
        parser: JsonParser::new(config.json_parsing.enabled),
    });
    let app = build_router(state, config.server.max_body_bytes);
    let stop = CancellationToken::new();

    let retention = (config.storage.ttl_days > 0).then(|| {
        tokio::spawn(retention_loop(
            Arc::clone(&store),
            config.storage.retention_interval,
            stop.clone(),
        ))
    });

    let mut server = match tls {
        Some(tls) => tokio::spawn(serve_tls(listener, app, tls, stop.clone())),
        None => tokio::spawn(serve(listener, app, stop.clone())),
    };

    tokio::select! {
        _ = shutdown => {
            info!("Shutdown signal received");
        }
        result = &mut server => {
            // Serving ended on its own, which only happens on error
            stop.cancel();
            result??;
            return Ok(());
        }
    }
    stop.cancel();

    match tokio::time::timeout(config.server.shutdown_timeout, &mut server).await {
        Ok(result) => result??,
        Err(_) => {
            warn!(
                timeout_secs = config.server.shutdown_timeout.as_secs(),
                "Shutdown timeout elapsed, dropping open connections"
            );
            server.abort();
        }
    }

    if let Some(retention) = retention {
        let _ = retention.await;
    }

    store.close().await?;
    info!("Server shutdown complete");
    Ok(())
}

async fn retention_loop(store: Arc<dyn LogStore>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match store.purge_expired().await {
                Ok(0) => debug!("Retention pass found nothing to purge"),
                Ok(purged) => info!(purged, "Retention pass complete"),
                Err(e) => warn!(error = %e, "Retention pass failed"),
            },
        }
    }
}

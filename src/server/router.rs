use crate::server::api::{health, ingest, IngestState};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::info;

/// Ingestion and health routes with request tracing and panic recovery.
pub fn build_router(state: Arc<IngestState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/v1/logs/ingest", post(ingest))
        .route("/v1/health", get(health))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::new()),
        )
        .with_state(state)
}

/// Serve until `shutdown` fires, then stop accepting and let open requests finish.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Ingestion server listening");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Ingestion server shutting down gracefully");
        })
        .await
}

/// Like [`serve`], but every connection goes through the TLS handshake
/// described by `tls` first.
pub async fn serve_tls(
    listener: TcpListener,
    app: Router,
    tls: Arc<rustls::ServerConfig>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    let listener = listener.into_std()?;

    let handle = Handle::new();
    let stopper = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        info!("Ingestion server shutting down gracefully");
        stopper.graceful_shutdown(None);
    });

    info!(addr = %addr, "Ingestion server listening with TLS");
    axum_server::from_tcp_rustls(listener, RustlsConfig::from_config(tls))
        .handle(handle)
        .serve(app.into_make_service())
        .await
}

use crate::collector::batch::{BatchError, LogBatch};
use crate::server::parser::JsonParser;
use crate::storage::traits::{LogStore, StorageError};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared state for the ingestion API
pub struct IngestState {
    pub store: Arc<dyn LogStore>,
    pub parser: JsonParser,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub status: String,
    pub received: usize,
}

/// POST /v1/logs/ingest
pub async fn ingest(
    State(state): State<Arc<IngestState>>,
    payload: Result<Json<LogBatch>, JsonRejection>,
) -> Result<Json<IngestResponse>, ApiError> {
    let Json(mut batch) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    batch.validate()?;

    let parsed = state.parser.apply(&mut batch);
    let outcome = state.store.insert_batch(&batch).await?;

    tracing::info!(
        service = %batch.service_name,
        received = batch.len(),
        inserted = outcome.inserted,
        duplicates = outcome.duplicates,
        parsed,
        "Ingested batch"
    );

    Ok(Json(IngestResponse {
        status: "success".to_string(),
        received: batch.len(),
    }))
}

/// GET /v1/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl From<BatchError> for ApiError {
    fn from(e: BatchError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Storage(e) => {
                tracing::error!(error = %e, "Failed to store batch");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::duckdb::DuckDbStorage;

    fn state() -> Arc<IngestState> {
        Arc::new(IngestState {
            store: Arc::new(DuckDbStorage::in_memory("logs_", 30).unwrap()),
            parser: JsonParser::new(true),
        })
    }

    #[test]
    fn test_validation_errors_are_plain_text_400() {
        let response = ApiError::from(BatchError::Empty).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_storage_errors_are_500() {
        let response =
            ApiError::Storage(StorageError::Database("disk full".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let batch = LogBatch {
            service_name: "api".to_string(),
            entries: vec![],
        };
        let result = ingest(State(state()), Ok(Json(batch))).await;
        match result {
            Err(ApiError::BadRequest(msg)) => assert_eq!(msg, "entries cannot be empty"),
            other => panic!("expected bad request, got {:?}", other.map(|j| j.0)),
        }
    }

    #[tokio::test]
    async fn test_missing_service_name_rejected() {
        let batch = LogBatch {
            service_name: String::new(),
            entries: vec![],
        };
        let result = ingest(State(state()), Ok(Json(batch))).await;
        assert!(matches!(result, Err(ApiError::BadRequest(msg)) if msg == "service_name is required"));
    }

    #[tokio::test]
    async fn test_health() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "healthy");
    }
}

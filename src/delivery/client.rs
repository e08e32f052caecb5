use crate::collector::batch::LogBatch;
use crate::collector::batcher::BatchSender;
use crate::config::types::TailerConfig;
use crate::delivery::circuit_breaker::CircuitBreaker;
use crate::delivery::retry::{RetryError, RetryPolicy, Retryable};
use crate::delivery::tls::{build_http_client, TlsError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("server error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("unexpected status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    #[error("circuit breaker open, batch not sent")]
    CircuitOpen,

    #[error("delivery cancelled")]
    Cancelled,

    #[error(transparent)]
    Tls(#[from] TlsError),
}

impl Retryable for DeliveryError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::Http(_)
                | DeliveryError::ServerError { .. }
                | DeliveryError::UnexpectedStatus { .. }
        )
    }
}

/// How the server answered a delivered batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted { received: usize },
    /// Definitive 4xx rejection; the batch is not resent
    Rejected { status: u16, message: String },
}

#[derive(Debug, Deserialize)]
struct IngestResponse {
    received: usize,
}

/// Sort one response into an outcome or an error by status class.
pub fn classify_response(
    status: StatusCode,
    body: &str,
    sent: usize,
) -> Result<SendOutcome, DeliveryError> {
    if status.is_success() {
        let received = serde_json::from_str::<IngestResponse>(body)
            .map(|r| r.received)
            .unwrap_or(sent);
        Ok(SendOutcome::Accepted { received })
    } else if status.is_client_error() {
        Ok(SendOutcome::Rejected {
            status: status.as_u16(),
            message: body.trim().to_string(),
        })
    } else if status.is_server_error() {
        Err(DeliveryError::ServerError {
            status: status.as_u16(),
            message: body.trim().to_string(),
        })
    } else {
        Err(DeliveryError::UnexpectedStatus {
            status: status.as_u16(),
            message: body.trim().to_string(),
        })
    }
}

/// Posts batches to the ingestion endpoint under the retry policy, gated by
/// a circuit breaker shared with whoever else sends to the same server.
pub struct DeliveryClient {
    http: reqwest::Client,
    url: String,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    cancel: CancellationToken,
}

impl DeliveryClient {
    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        retry: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            retry,
            breaker,
            cancel: CancellationToken::new(),
        }
    }

    /// Build the client described by a tailer config, loading TLS material.
    pub fn from_config(config: &TailerConfig) -> Result<Self, DeliveryError> {
        let http = build_http_client(config.server.timeout, config.tls.as_ref())?;
        Ok(Self::new(
            http,
            config.server.url.clone(),
            RetryPolicy::from(&config.server),
            Arc::new(CircuitBreaker::from_config(&config.circuit_breaker)),
        ))
    }

    /// Backoff waits end early once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn send(&self, batch: &LogBatch) -> Result<SendOutcome, DeliveryError> {
        if self.breaker.is_open() {
            tracing::debug!(service = %batch.service_name, "Circuit open, skipping send");
            return Err(DeliveryError::CircuitOpen);
        }

        let body = serde_json::to_vec(batch)?;
        let sent = batch.len();

        let result = self
            .retry
            .run(&self.cancel, |_attempt| self.attempt(body.clone(), sent))
            .await;

        match result {
            Ok(outcome) => {
                self.breaker.record_success();
                if let SendOutcome::Rejected { status, message } = &outcome {
                    tracing::warn!(
                        service = %batch.service_name,
                        status,
                        message = %message,
                        "Server rejected batch, not retrying"
                    );
                }
                Ok(outcome)
            }
            Err(e) => {
                // A cancelled send says nothing about the server's health
                let counts = match &e {
                    RetryError::Exhausted { .. } => true,
                    RetryError::Permanent(last) => last.is_retryable(),
                    RetryError::Cancelled { .. } => false,
                };
                if counts {
                    self.breaker.record_failure();
                }
                let error = e.into_last().unwrap_or(DeliveryError::Cancelled);
                tracing::error!(
                    service = %batch.service_name,
                    entries = sent,
                    error = %error,
                    "Batch delivery failed"
                );
                Err(error)
            }
        }
    }

    async fn attempt(&self, body: Vec<u8>, sent: usize) -> Result<SendOutcome, DeliveryError> {
        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        classify_response(status, &text, sent)
    }
}

#[async_trait]
impl BatchSender for DeliveryClient {
    async fn send_batch(&self, batch: &LogBatch) -> Result<SendOutcome, DeliveryError> {
        self.send(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::event::LogEvent;
    use std::time::Duration;

    #[test]
    fn test_classify_success_reads_received() {
        let outcome =
            classify_response(StatusCode::OK, r#"{"status":"success","received":7}"#, 9).unwrap();
        assert_eq!(outcome, SendOutcome::Accepted { received: 7 });

        let outcome = classify_response(StatusCode::CREATED, "", 9).unwrap();
        assert_eq!(outcome, SendOutcome::Accepted { received: 9 });
    }

    #[test]
    fn test_classify_client_error_is_terminal() {
        let outcome =
            classify_response(StatusCode::BAD_REQUEST, "entries cannot be empty\n", 0).unwrap();
        assert_eq!(
            outcome,
            SendOutcome::Rejected {
                status: 400,
                message: "entries cannot be empty".to_string()
            }
        );
    }

    #[test]
    fn test_classify_server_error_is_retryable() {
        let err = classify_response(StatusCode::SERVICE_UNAVAILABLE, "busy", 1).unwrap_err();
        assert!(matches!(err, DeliveryError::ServerError { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_redirect_is_retryable() {
        let err = classify_response(StatusCode::FOUND, "", 1).unwrap_err();
        assert!(matches!(err, DeliveryError::UnexpectedStatus { status: 302, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_open_circuit_fails_without_network() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(60)));
        breaker.record_failure();

        // Nothing listens here; an attempted connection would surface as Http
        let client = DeliveryClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/v1/logs/ingest",
            RetryPolicy::testing(),
            breaker,
        );
        let batch =
            LogBatch::new("api", vec![LogEvent::new("api", "h", "/var/log/a.log", "x", 1)])
                .unwrap();

        let err = client.send(&batch).await.unwrap_err();
        assert!(matches!(err, DeliveryError::CircuitOpen));
    }
}

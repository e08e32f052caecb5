pub mod circuit_breaker;
pub mod client;
pub mod retry;
pub mod tls;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::{DeliveryClient, DeliveryError, SendOutcome};
pub use retry::{RetryError, RetryPolicy, Retryable};
pub use tls::{build_http_client, TlsError};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration of the file-shipping process (`logship tailer`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailerConfig {
    pub service_name: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    pub log_files: Vec<LogFileConfig>,
    pub server: UpstreamConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub backpressure: BackpressureConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub tls: Option<ClientTlsConfig>,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl TailerConfig {
    /// Enabled files paired with the source identifier their lines are shipped under.
    pub fn enabled_files(&self) -> Vec<(PathBuf, String)> {
        self.log_files
            .iter()
            .filter(|f| f.enabled)
            .map(|f| {
                let service = f
                    .service_name
                    .clone()
                    .unwrap_or_else(|| self.service_name.clone());
                (f.path.clone(), service)
            })
            .collect()
    }
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/logship/tailer-state.json")
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFileConfig {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the tailer-wide `service_name` for this file
    #[serde(default)]
    pub service_name: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_wait", with = "humantime_serde")]
    pub initial_wait: Duration,
    #[serde(default = "default_max_wait", with = "humantime_serde")]
    pub max_wait: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_wait() -> Duration {
    Duration::from_secs(1)
}

fn default_max_wait() -> Duration {
    Duration::from_secs(60)
}

fn default_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,
    #[serde(default = "default_open_duration", with = "humantime_serde")]
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            open_duration: default_open_duration(),
        }
    }
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_open_duration() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_batch_wait", with = "humantime_serde")]
    pub max_wait: Duration,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Upper bound on concurrently running sends
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_wait: default_batch_wait(),
            queue_size: default_queue_size(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_max_size() -> usize {
    100
}

fn default_batch_wait() -> Duration {
    Duration::from_secs(5)
}

fn default_queue_size() -> usize {
    1000
}

fn default_max_in_flight() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    #[serde(default = "default_backpressure_strategy")]
    pub strategy: BackpressureStrategy,
    /// How long a watcher waits on a full intake queue before dropping (drop strategy only)
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            strategy: default_backpressure_strategy(),
            send_timeout: default_send_timeout(),
        }
    }
}

fn default_backpressure_strategy() -> BackpressureStrategy {
    BackpressureStrategy::Drop
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureStrategy {
    /// Wait up to `send_timeout`, then discard the event
    Drop,
    /// Wait until the queue has room (still cancellable)
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_checkpoint_interval", with = "humantime_serde")]
    pub checkpoint_interval: Duration,
    /// Consecutive read failures tolerated before a file's watch task gives up
    #[serde(default = "default_max_read_errors")]
    pub max_read_errors: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            checkpoint_interval: default_checkpoint_interval(),
            max_read_errors: default_max_read_errors(),
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_checkpoint_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_max_read_errors() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTlsConfig {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

/// Configuration of the ingestion process (`logship server`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub json_parsing: JsonParsingConfig,
    /// Without this block the server listens in plaintext
    #[serde(default)]
    pub tls: Option<ServerTlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTlsConfig {
    /// Trust anchor for client certificates; unused with `client_auth: none`
    #[serde(default)]
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    #[serde(default)]
    pub client_auth: ClientAuth,
}

/// How the server treats client certificates during the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuth {
    /// Handshake fails without a certificate signed by `ca_cert`
    #[default]
    Require,
    /// A certificate is verified if offered, but not demanded
    Request,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            shutdown_timeout: default_shutdown_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,
    /// Days before stored events expire; 0 keeps them forever
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,
    #[serde(default = "default_retention_interval", with = "humantime_serde")]
    pub retention_interval: Duration,
}

fn default_collection_prefix() -> String {
    "logs_".to_string()
}

fn default_ttl_days() -> u32 {
    30
}

fn default_retention_interval() -> Duration {
    Duration::from_secs(3600)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonParsingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for JsonParsingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

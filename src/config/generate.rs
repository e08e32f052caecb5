/// Commented starter configuration for the tailer process.
pub fn generate_tailer_config() -> String {
    r#"# =============================================================================
# LOGSHIP TAILER CONFIGURATION
# =============================================================================
# Tails local log files and ships their lines to a logship server.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/logship/tailer.yml
#   3. /etc/logship/tailer.yml
#
# Values may reference environment variables with $env{NAME}.

# Logical source identifier. Determines batching and the storage collection.
service_name: my-service

# Defaults to this machine's host name.
# hostname: web-01

log_files:
  - path: /var/log/my-service/app.log
  - path: /var/log/nginx/access.log
    # Ship this file under a different source identifier
    service_name: nginx
  - path: /var/log/my-service/debug.log
    enabled: false

server:
  url: https://logs.example.com:8443/v1/logs/ingest
  timeout: 30s
  # Attempts per batch are max_retries + 1
  max_retries: 5
  initial_wait: 1s
  max_wait: 60s
  multiplier: 2.0

circuit_breaker:
  # Consecutive failed batches before sends are rejected locally
  threshold: 5
  open_duration: 60s

batching:
  max_size: 100
  max_wait: 5s
  queue_size: 1000
  max_in_flight: 4

backpressure:
  # 'drop': wait send_timeout for queue space, then discard the line
  # 'block': pause reading the file until the queue has space
  strategy: drop
  send_timeout: 5s

watcher:
  poll_interval: 250ms
  checkpoint_interval: 10s
  max_read_errors: 5

# Mutual TLS towards the server. Missing or invalid files abort startup.
tls:
  ca_cert: /etc/logship/certs/ca.pem
  client_cert: /etc/logship/certs/client.pem
  client_key: /etc/logship/certs/client-key.pem

state_file: /var/lib/logship/tailer-state.json
shutdown_timeout: 30s
"#
    .to_string()
}

/// Commented starter configuration for the ingestion server.
pub fn generate_server_config() -> String {
    r#"# =============================================================================
# LOGSHIP SERVER CONFIGURATION
# =============================================================================
# Accepts batches from tailers and persists them per source.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/logship/server.yml
#   3. /etc/logship/server.yml

server:
  listen: 0.0.0.0:8443
  shutdown_timeout: 30s
  max_body_bytes: 10485760

storage:
  path: /var/lib/logship/logs.duckdb
  # Each source gets its own table: <prefix><sanitized source name>
  collection_prefix: logs_
  # Events older than this are purged; 0 keeps everything
  ttl_days: 30
  retention_interval: 1h

json_parsing:
  # Lines that are JSON objects are stored with a parsed copy
  enabled: true

# TLS termination. Without this block the server listens in plaintext.
# Missing or invalid files abort startup.
tls:
  ca_cert: /etc/logship/certs/ca.pem
  server_cert: /etc/logship/certs/server.pem
  server_key: /etc/logship/certs/server-key.pem
  # 'require': reject clients without a certificate signed by ca_cert
  # 'request': verify a certificate if one is offered
  # 'none': no client certificates
  client_auth: require
"#
    .to_string()
}

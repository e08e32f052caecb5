use logship::config::generate::{generate_server_config, generate_tailer_config};
use logship::config::{load_server_config, load_tailer_config, ConfigError};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_generated_tailer_config_is_valid() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("tailer.yml");
    fs::write(&config_path, generate_tailer_config()).unwrap();

    let config = load_tailer_config(&config_path).expect("Generated config should be valid");

    assert_eq!(config.service_name, "my-service");
    let files = config.enabled_files();
    assert_eq!(files.len(), 2);
    assert_eq!(files[1].1, "nginx");
    assert_eq!(config.server.max_retries, 5);
    assert_eq!(config.batching.max_wait, Duration::from_secs(5));
}

#[test]
fn test_generated_server_config_is_valid() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("server.yml");
    fs::write(&config_path, generate_server_config()).unwrap();

    let config = load_server_config(&config_path).expect("Generated config should be valid");

    assert_eq!(config.server.listen, "0.0.0.0:8443");
    assert_eq!(config.storage.collection_prefix, "logs_");
    assert!(config.json_parsing.enabled);
}

#[test]
fn test_env_vars_expanded_in_file() {
    std::env::set_var("LOGSHIP_IT_SERVER_URL", "http://10.0.0.5:8080/v1/logs/ingest");
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("tailer.yml");
    fs::write(
        &config_path,
        "service_name: api\nhostname: h\nlog_files:\n  - path: /tmp/a.log\nserver:\n  url: $env{LOGSHIP_IT_SERVER_URL}\n",
    )
    .unwrap();

    let config = load_tailer_config(&config_path).unwrap();
    assert_eq!(config.server.url, "http://10.0.0.5:8080/v1/logs/ingest");
    std::env::remove_var("LOGSHIP_IT_SERVER_URL");
}

#[test]
fn test_missing_file_reports_path() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("absent.yml");

    let err = load_server_config(&missing).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
    assert!(err.to_string().contains("absent.yml"));
}

#[test]
fn test_invalid_tailer_config_lists_every_problem() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("tailer.yml");
    fs::write(
        &config_path,
        "service_name: ''\nhostname: h\nlog_files: []\nserver:\n  url: ftp://nowhere\n",
    )
    .unwrap();

    match load_tailer_config(&config_path) {
        Err(ConfigError::ValidationList(errors)) => {
            assert_eq!(errors.len(), 3);
        }
        other => panic!("expected validation errors, got {:?}", other.map(|_| ())),
    }
}

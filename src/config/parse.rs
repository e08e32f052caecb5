use super::types::*;
use crate::config::{expand_env_vars, expand_tilde};
use regex::Regex;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_tailer_config(path: &Path) -> Result<TailerConfig, ConfigError> {
    let mut config: TailerConfig = read_yaml(path)?;

    for file in &mut config.log_files {
        file.path = expand_tilde(&file.path);
    }
    config.state_file = expand_tilde(&config.state_file);
    if let Some(tls) = config.tls.as_mut() {
        tls.ca_cert = expand_tilde(&tls.ca_cert);
        tls.client_cert = expand_tilde(&tls.client_cert);
        tls.client_key = expand_tilde(&tls.client_key);
    }

    validate_tailer_config(&config)?;
    Ok(config)
}

pub fn load_server_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let mut config: ServerConfig = read_yaml(path)?;
    config.storage.path = expand_tilde(&config.storage.path);
    if let Some(tls) = config.tls.as_mut() {
        tls.ca_cert = expand_tilde(&tls.ca_cert);
        tls.server_cert = expand_tilde(&tls.server_cert);
        tls.server_key = expand_tilde(&tls.server_key);
    }

    validate_server_config(&config)?;
    Ok(config)
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let yaml_string = fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_yaml(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Expand `$env{..}` references and deserialize.
pub fn parse_yaml<T: DeserializeOwned>(yaml: &str) -> Result<T, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;
    Ok(serde_yaml::from_str(&yaml_string)?)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let re = Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    let mut unexpanded_vars: Vec<String> = re
        .captures_iter(yaml_string)
        .map(|cap| cap[1].to_string())
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    Err(ConfigError::Validation(format!(
        "environment variables are not set: {}",
        unexpanded_vars.join(", ")
    )))
}

pub fn validate_tailer_config(config: &TailerConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.service_name.trim().is_empty() {
        errors.push("service_name is required".to_string());
    }
    if config.hostname.trim().is_empty() {
        errors.push("hostname cannot be empty".to_string());
    }
    if config.server.url.trim().is_empty() {
        errors.push("server.url is required".to_string());
    } else if !config.server.url.starts_with("http://") && !config.server.url.starts_with("https://") {
        errors.push(format!(
            "server.url must be an http:// or https:// URL, got '{}'",
            config.server.url
        ));
    }

    if config.log_files.is_empty() {
        errors.push("at least one log file must be configured".to_string());
    } else if !config.log_files.iter().any(|f| f.enabled) {
        errors.push("no enabled log files configured".to_string());
    }

    let mut seen = HashSet::new();
    for (i, file) in config.log_files.iter().enumerate() {
        if file.path.as_os_str().is_empty() {
            errors.push(format!("log_files[{}]: path cannot be empty", i));
        } else if !seen.insert(&file.path) {
            errors.push(format!(
                "log_files[{}]: duplicate path '{}'",
                i,
                file.path.display()
            ));
        }
        if let Some(service) = &file.service_name {
            if service.trim().is_empty() {
                errors.push(format!("log_files[{}]: service_name cannot be empty", i));
            }
        }
    }

    if config.server.multiplier < 1.0 {
        errors.push("server.multiplier must be >= 1.0".to_string());
    }
    if config.server.initial_wait > config.server.max_wait {
        errors.push("server.initial_wait cannot exceed server.max_wait".to_string());
    }
    if config.circuit_breaker.threshold == 0 {
        errors.push("circuit_breaker.threshold must be at least 1".to_string());
    }
    if config.batching.max_size == 0 {
        errors.push("batching.max_size must be at least 1".to_string());
    }
    if config.batching.max_wait.is_zero() {
        errors.push("batching.max_wait must be greater than zero".to_string());
    }
    if config.batching.queue_size == 0 {
        errors.push("batching.queue_size must be at least 1".to_string());
    }
    if config.batching.max_in_flight == 0 {
        errors.push("batching.max_in_flight must be at least 1".to_string());
    }
    if config.watcher.poll_interval.is_zero() {
        errors.push("watcher.poll_interval must be greater than zero".to_string());
    }
    if config.watcher.checkpoint_interval.is_zero() {
        errors.push("watcher.checkpoint_interval must be greater than zero".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

pub fn validate_server_config(config: &ServerConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.storage.path.as_os_str().is_empty() {
        errors.push("storage.path is required".to_string());
    }
    if config.server.listen.parse::<std::net::SocketAddr>().is_err() {
        errors.push(format!(
            "server.listen must be a socket address, got '{}'",
            config.server.listen
        ));
    }
    if !config
        .storage
        .collection_prefix
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        errors.push(format!(
            "storage.collection_prefix may only contain [a-z0-9_], got '{}'",
            config.storage.collection_prefix
        ));
    }
    if config.storage.ttl_days > 0 && config.storage.retention_interval.is_zero() {
        errors.push("storage.retention_interval must be greater than zero".to_string());
    }
    if let Some(tls) = &config.tls {
        if tls.server_cert.as_os_str().is_empty() {
            errors.push("tls.server_cert is required".to_string());
        }
        if tls.server_key.as_os_str().is_empty() {
            errors.push("tls.server_key is required".to_string());
        }
        if tls.client_auth != ClientAuth::None && tls.ca_cert.as_os_str().is_empty() {
            errors.push("tls.ca_cert is required unless tls.client_auth is 'none'".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

use crate::config::types::ClientTlsConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {what} '{path}': {source}")]
    Read {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {what} '{path}': {source}")]
    Invalid {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

fn read_pem(what: &'static str, path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        what,
        path: path.to_path_buf(),
        source,
    })
}

/// Build the HTTP client used for delivery. With `tls` set, the client only
/// trusts the configured CA and presents the configured identity; any
/// missing or unparseable file is returned as an error so startup can abort.
pub fn build_http_client(
    timeout: Duration,
    tls: Option<&ClientTlsConfig>,
) -> Result<reqwest::Client, TlsError> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .use_rustls_tls();

    if let Some(tls) = tls {
        let ca_pem = read_pem("CA certificate", &tls.ca_cert)?;
        let ca = reqwest::Certificate::from_pem(&ca_pem).map_err(|source| TlsError::Invalid {
            what: "CA certificate",
            path: tls.ca_cert.clone(),
            source,
        })?;

        // Identity::from_pem wants certificate chain and private key in one buffer
        let mut identity_pem = read_pem("client certificate", &tls.client_cert)?;
        identity_pem.push(b'\n');
        identity_pem.extend(read_pem("client key", &tls.client_key)?);
        let identity =
            reqwest::Identity::from_pem(&identity_pem).map_err(|source| TlsError::Invalid {
                what: "client identity",
                path: tls.client_cert.clone(),
                source,
            })?;

        builder = builder
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .identity(identity);

        tracing::info!(
            ca = %tls.ca_cert.display(),
            cert = %tls.client_cert.display(),
            "Mutual TLS enabled"
        );
    }

    builder.build().map_err(TlsError::Client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_plain_client_builds() {
        assert!(build_http_client(Duration::from_secs(5), None).is_ok());
    }

    #[test]
    fn test_missing_certificate_is_fatal() {
        let dir = TempDir::new().unwrap();
        let tls = ClientTlsConfig {
            ca_cert: dir.path().join("ca.pem"),
            client_cert: dir.path().join("client.pem"),
            client_key: dir.path().join("client-key.pem"),
        };
        let err = build_http_client(Duration::from_secs(5), Some(&tls)).unwrap_err();
        assert!(matches!(err, TlsError::Read { what: "CA certificate", .. }));
    }

    #[test]
    fn test_garbage_identity_is_fatal() {
        let dir = TempDir::new().unwrap();
        let ca = dir.path().join("ca.pem");
        let cert = dir.path().join("client.pem");
        let key = dir.path().join("client-key.pem");
        std::fs::write(&ca, "not a certificate").unwrap();
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();

        let tls = ClientTlsConfig {
            ca_cert: ca,
            client_cert: cert,
            client_key: key,
        };
        assert!(build_http_client(Duration::from_secs(5), Some(&tls)).is_err());
    }
}

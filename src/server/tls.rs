use crate::config::types::{ClientAuth, ServerTlsConfig};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerTlsError {
    #[error("failed to read {what} '{path}': {source}")]
    Read {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {what} '{path}': {reason}")]
    Invalid {
        what: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("TLS setup failed: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("client certificate verifier: {0}")]
    Verifier(#[from] VerifierBuilderError),
}

fn open_pem(what: &'static str, path: &Path) -> Result<BufReader<File>, ServerTlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ServerTlsError::Read {
            what,
            path: path.to_path_buf(),
            source,
        })
}

fn read_certs(what: &'static str, path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerTlsError> {
    let mut reader = open_pem(what, path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerTlsError::Invalid {
            what,
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(ServerTlsError::Invalid {
            what,
            path: path.to_path_buf(),
            reason: "no PEM certificates found".to_string(),
        });
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerTlsError> {
    const WHAT: &str = "server key";
    let mut reader = open_pem(WHAT, path)?;
    let invalid = |reason: String| ServerTlsError::Invalid {
        what: WHAT,
        path: path.to_path_buf(),
        reason,
    };

    match rustls_pemfile::private_key(&mut reader) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(invalid("no PEM private key found".to_string())),
        Err(e) => Err(invalid(e.to_string())),
    }
}

/// Build the listener's TLS settings: TLS 1.3 only, the configured server
/// identity and client certificates checked against `ca_cert` according to
/// `client_auth`. Any unreadable or unparseable file is an error so startup
/// can abort.
pub fn load_server_tls(config: &ServerTlsConfig) -> Result<Arc<rustls::ServerConfig>, ServerTlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let certs = read_certs("server certificate", &config.server_cert)?;
    let key = read_key(&config.server_key)?;

    let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])?;

    let builder = match config.client_auth {
        ClientAuth::None => builder.with_no_client_auth(),
        mode => {
            let verifier = client_verifier(&config.ca_cert, mode, provider)?;
            builder.with_client_cert_verifier(verifier)
        }
    };

    let mut server = builder.with_single_cert(certs, key)?;
    server.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    tracing::info!(
        cert = %config.server_cert.display(),
        client_auth = ?config.client_auth,
        "TLS enabled"
    );
    Ok(Arc::new(server))
}

fn client_verifier(
    ca_cert: &Path,
    mode: ClientAuth,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn rustls::server::danger::ClientCertVerifier>, ServerTlsError> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs("CA certificate", ca_cert)? {
        roots.add(cert)?;
    }

    let builder = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
    let builder = match mode {
        ClientAuth::Request => builder.allow_unauthenticated(),
        _ => builder,
    };
    Ok(builder.build()?)
}

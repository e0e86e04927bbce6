//! TLS termination: building the acceptor and running server-side handshakes.

use crate::config::TlsConfig;
use crate::error::ServerError;
use crate::stream::MaybeTlsStream;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

/// Loads certificates from the configured paths and creates a TLS acceptor.
pub fn create_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
    let cert_path = config
        .cert_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("cert_path not set".into()))?;
    let key_path = config
        .key_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("key_path not set".into()))?;
    if config.require_client_cert && config.client_ca_path.is_none() {
        return Err(ServerError::TlsConfig(
            "client_ca_path not set for mTLS".into(),
        ));
    }

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let server_config = match config.client_ca_path.as_deref() {
        Some(ca_path) if config.require_client_cert => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(load_roots(ca_path)?))
                .build()
                .map_err(|e| {
                    ServerError::TlsConfig(format!("failed to build client verifier: {}", e))
                })?;
            builder.with_client_cert_verifier(verifier)
        }
        _ => builder.with_no_client_auth(),
    }
    .with_single_cert(certs, key)
    .map_err(|e| ServerError::TlsConfig(format!("invalid server cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Performs the server-side handshake when an acceptor is configured,
/// otherwise passes the stream through untouched.
pub(crate) async fn maybe_accept<IO>(
    io: IO,
    acceptor: Option<&TlsAcceptor>,
    peer: &(impl fmt::Display + ?Sized),
) -> Result<MaybeTlsStream<IO>, ServerError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    match acceptor {
        Some(acceptor) => {
            tracing::debug!("[{}] Performing TLS handshake", peer);
            let stream = acceptor
                .accept(io)
                .await
                .map_err(|e| ServerError::TlsHandshake(e.to_string()))?;
            tracing::debug!("[{}] TLS handshake complete", peer);
            Ok(MaybeTlsStream::Tls { stream })
        }
        None => Ok(MaybeTlsStream::Plain { stream: io }),
    }
}

fn load_roots(path: &Path) -> Result<RootCertStore, ServerError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| ServerError::TlsConfig(format!("invalid client CA cert: {}", e)))?;
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let mut reader = open(path, "cert")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ServerError::TlsConfig(format!(
            "no certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let mut reader = open(path, "key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ServerError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        .ok_or_else(|| ServerError::TlsConfig(format!("no private key found in {:?}", path)))
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>, ServerError> {
    File::open(path).map(BufReader::new).map_err(|e| {
        ServerError::TlsConfig(format!("cannot open {} file {:?}: {}", what, path, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    fn tls_config(cert: Option<PathBuf>, key: Option<PathBuf>) -> TlsConfig {
        TlsConfig {
            enabled: true,
            cert_path: cert,
            key_path: key,
            require_client_cert: false,
            client_ca_path: None,
        }
    }

    #[test]
    fn test_load_invalid_cert_path() {
        let result = load_certs(Path::new("/nonexistent/cert.pem"));
        assert!(result.unwrap_err().to_string().contains("cannot open cert file"));
    }

    #[test]
    fn test_load_invalid_key_path() {
        let result = load_private_key(Path::new("/nonexistent/key.pem"));
        assert!(result.unwrap_err().to_string().contains("cannot open key file"));
    }

    #[test]
    fn test_load_garbage_key_file() {
        let mut key_file = NamedTempFile::new().unwrap();
        key_file.write_all(b"not a valid key").unwrap();

        let result = load_private_key(key_file.path());
        assert!(result.unwrap_err().to_string().contains("no private key"));
    }

    #[test]
    fn test_load_empty_cert_file() {
        let cert_file = NamedTempFile::new().unwrap();
        let result = load_certs(cert_file.path());
        assert!(result.unwrap_err().to_string().contains("no certificates"));
    }

    #[test]
    fn test_create_acceptor_missing_cert() {
        let config = tls_config(None, Some("/some/key.pem".into()));
        match create_tls_acceptor(&config) {
            Err(e) => assert!(e.to_string().contains("cert_path not set")),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_create_acceptor_missing_key() {
        let config = tls_config(Some("/some/cert.pem".into()), None);
        match create_tls_acceptor(&config) {
            Err(e) => assert!(e.to_string().contains("key_path not set")),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_create_acceptor_mtls_missing_ca() {
        let mut config = tls_config(
            Some("/nonexistent/cert.pem".into()),
            Some("/nonexistent/key.pem".into()),
        );
        config.require_client_cert = true;

        // The CA check runs before any file is opened.
        match create_tls_acceptor(&config) {
            Err(e) => assert!(e.to_string().contains("client_ca_path not set")),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_create_acceptor_from_fixtures() {
        let config = tls_config(Some(fixture("server.pem")), Some(fixture("server.key")));
        assert!(create_tls_acceptor(&config).is_ok());
    }

    #[test]
    fn test_create_acceptor_with_client_ca() {
        let mut config = tls_config(Some(fixture("server.pem")), Some(fixture("server.key")));
        config.require_client_cert = true;
        config.client_ca_path = Some(fixture("ca.pem"));
        assert!(create_tls_acceptor(&config).is_ok());
    }

    #[tokio::test]
    async fn test_maybe_accept_plain() {
        let (_client, server) = tokio::io::duplex(16);
        let stream = maybe_accept(server, None, "test-peer").await.unwrap();
        assert!(!stream.is_tls());
    }

    #[tokio::test]
    async fn test_maybe_accept_rejects_non_tls_client() {
        use tokio::io::AsyncWriteExt;

        let config = tls_config(Some(fixture("server.pem")), Some(fixture("server.key")));
        let acceptor = create_tls_acceptor(&config).unwrap();

        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        drop(client);

        let result = maybe_accept(server, Some(&acceptor), "test-peer").await;
        assert!(matches!(result, Err(ServerError::TlsHandshake(_))));
    }
}

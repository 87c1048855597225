//! TLS transports
//!
//! Both TLS encryption kinds use the certificate material supplied with the
//! assignment: the agent presents the certificate chain and private key, and
//! the client pins the same certificate as its sole trust anchor. No other
//! roots are consulted.

use std::sync::{Arc, Once};
use std::time::Duration;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::{StreamTransport, TransportError};

/// Timeout for the TLS handshake itself
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider as the process default, once.
fn ensure_crypto_provider() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Parse PEM-encoded certificates.
fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(TransportError::Tls("no certificates found".to_string()));
    }
    Ok(certs)
}

/// Parse a PEM-encoded private key.
fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TransportError> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| TransportError::Tls(format!("failed to parse private key: {}", e)))
}

/// Perform a client-side TLS handshake and wrap the result in a framed
/// transport. The supplied PEM certificates become the only trust anchors.
pub async fn tls_connect(
    stream: TcpStream,
    cert_pem: &[u8],
    server_name: &str,
) -> Result<StreamTransport<tokio_rustls::client::TlsStream<TcpStream>>, TransportError> {
    ensure_crypto_provider();

    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(cert_pem)? {
        roots
            .add(cert)
            .map_err(|e| TransportError::Tls(format!("failed to add trust anchor: {}", e)))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| TransportError::Tls(format!("invalid server name '{}'", server_name)))?;

    let tls_stream = timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(name, stream))
        .await
        .map_err(|_| TransportError::Tls("TLS handshake timed out".to_string()))?
        .map_err(|e| TransportError::Tls(format!("TLS handshake failed: {}", e)))?;

    tracing::debug!("Client TLS handshake complete with {}", server_name);
    Ok(StreamTransport::new(tls_stream))
}

/// Perform a server-side TLS handshake presenting the supplied certificate
/// chain and private key, and wrap the result in a framed transport.
pub async fn tls_accept(
    stream: TcpStream,
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<StreamTransport<tokio_rustls::server::TlsStream<TcpStream>>, TransportError> {
    ensure_crypto_provider();

    let certs = parse_certificates(cert_pem)?;
    let key = parse_private_key(key_pem)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(format!("server config error: {}", e)))?;
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let tls_stream = timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream))
        .await
        .map_err(|_| TransportError::Tls("TLS handshake timed out".to_string()))?
        .map_err(|e| TransportError::Tls(format!("TLS handshake failed: {}", e)))?;

    tracing::debug!("Server TLS handshake complete");
    Ok(StreamTransport::new(tls_stream))
}

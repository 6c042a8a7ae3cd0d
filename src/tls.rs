use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpStream;

use crate::async_stream::AsyncStream;

/// Pre-built TLS termination capability. The engine never inspects the TLS
/// configuration, it only wraps accepted streams with it.
#[async_trait]
pub trait TlsAcceptor: Send + Sync {
    async fn accept(&self, stream: TcpStream) -> std::io::Result<Box<dyn AsyncStream>>;
}

#[async_trait]
impl TlsAcceptor for tokio_rustls::TlsAcceptor {
    async fn accept(&self, stream: TcpStream) -> std::io::Result<Box<dyn AsyncStream>> {
        tokio_rustls::TlsAcceptor::accept(self, stream)
            .await
            .map(|mut s| {
                s.get_mut().1.set_buffer_limit(Some(32768));
                Box::new(s) as Box<dyn AsyncStream>
            })
    }
}

fn load_certs(cert_bytes: &[u8]) -> std::io::Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(cert_bytes)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("failed to parse certificates: {e:?}"),
            )
        })?;
    if certs.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "no certificates found",
        ));
    }
    Ok(certs)
}

fn load_private_key(key_bytes: &[u8]) -> std::io::Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_slice(key_bytes).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("failed to parse private key: {e:?}"),
        )
    })
}

/// Builds a rustls-backed acceptor from PEM cert and key bytes.
pub fn create_acceptor(
    cert_bytes: &[u8],
    key_bytes: &[u8],
) -> std::io::Result<Arc<dyn TlsAcceptor>> {
    let certs = load_certs(cert_bytes)?;
    let privkey = load_private_key(key_bytes)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, privkey)
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad certificate/key: {e}"),
            )
        })?;
    let acceptor: tokio_rustls::TlsAcceptor = Arc::new(config).into();
    Ok(Arc::new(acceptor))
}

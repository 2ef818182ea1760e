//! Socket and TLS transport.
//!
//! [`connect_unsecure`] and [`connect_secure`] produce a connected
//! [`Peer`]; the link handshake runs on top of it afterwards.

pub mod peer;
pub mod verify;

pub use peer::{IoClass, Peer, PeerStream, ShutdownHandle, io_error};
pub use verify::{HostAuthOptions, HostVerifier, VerifyOps};

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::error::SpiceError;

/// Plain TCP connection to `host:port`.
pub async fn connect_unsecure(host: &str, port: u16) -> Result<Peer, SpiceError> {
    let tcp = peer::connect_tcp(host, port).await?;
    Ok(Peer::from_stream(PeerStream::Plain(tcp)))
}

/// TLS connection to `host:port`, verified with `options`.
pub async fn connect_secure(
    options: &HostAuthOptions,
    host: &str,
    port: u16,
) -> Result<Peer, SpiceError> {
    let connector = tls_connector(options, host)?;
    let name = ServerName::try_from(host.to_string())
        .map_err(|e| SpiceError::TlsHandshakeFailed(format!("invalid server name {host}: {e}")))?;

    let tcp = peer::connect_tcp(host, port).await?;
    let tls = connector.connect(name, tcp).await.map_err(tls_error)?;
    info!(host, port, "TLS connection established");
    Ok(Peer::from_stream(PeerStream::Tls(Box::new(tls))))
}

fn tls_connector(options: &HostAuthOptions, host: &str) -> Result<TlsConnector, SpiceError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let roots = match &options.ca_file {
        Some(path) => load_roots(path)?,
        None => RootCertStore::empty(),
    };
    let verifier = HostVerifier::new(Arc::new(roots), options.clone(), host, provider.clone());

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| SpiceError::TlsHandshakeFailed(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Load every certificate in a PEM bundle as a trust anchor.
pub fn load_roots(path: &Path) -> Result<RootCertStore, SpiceError> {
    let file = std::fs::File::open(path).map_err(|e| {
        SpiceError::TlsHandshakeFailed(format!("cannot open CA file {}: {e}", path.display()))
    })?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
        let cert = cert.map_err(|e| {
            SpiceError::TlsHandshakeFailed(format!("bad CA file {}: {e}", path.display()))
        })?;
        roots
            .add(cert)
            .map_err(|e| SpiceError::TlsHandshakeFailed(format!("bad CA certificate: {e}")))?;
    }
    debug!(path = %path.display(), count = roots.len(), "loaded trust anchors");
    Ok(roots)
}

/// Certificate policy failures become `TlsVerifyFailed`; everything
/// else during the handshake is `TlsHandshakeFailed`.
fn tls_error(err: std::io::Error) -> SpiceError {
    let verify = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .and_then(|e| match e {
            rustls::Error::InvalidCertificate(reason) => Some(format!("{reason:?}")),
            _ => None,
        });
    match verify {
        Some(reason) => SpiceError::TlsVerifyFailed(reason),
        None => SpiceError::TlsHandshakeFailed(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::CertificateError;

    #[test]
    fn invalid_certificate_maps_to_verify_failure() {
        let io = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer),
        );
        assert!(matches!(tls_error(io), SpiceError::TlsVerifyFailed(_)));

        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, rustls::Error::DecryptError);
        assert!(matches!(tls_error(io), SpiceError::TlsHandshakeFailed(_)));
    }

    #[test]
    fn missing_ca_file_is_an_error() {
        assert!(load_roots(Path::new("/nonexistent/ca.pem")).is_err());
    }

    #[test]
    fn connector_builds_without_roots() {
        assert!(tls_connector(&HostAuthOptions::default(), "localhost").is_ok());
    }
}

//! rustls server configuration.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// ALPN identifier for HTTP/2 over TLS.
pub const ALPN_H2: &[u8] = b"h2";
/// ALPN identifier for HTTP/1.1.
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Failure to build a TLS configuration.
#[derive(Debug)]
pub enum TlsConfigError {
    Read(PathBuf, std::io::Error),
    NoCertificates(PathBuf),
    NoPrivateKey(PathBuf),
    Rustls(rustls::Error),
}

impl std::fmt::Display for TlsConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsConfigError::Read(path, e) => {
                write!(f, "failed to read '{}': {}", path.display(), e)
            }
            TlsConfigError::NoCertificates(path) => {
                write!(f, "no certificates found in '{}'", path.display())
            }
            TlsConfigError::NoPrivateKey(path) => {
                write!(f, "no private key found in '{}'", path.display())
            }
            TlsConfigError::Rustls(e) => write!(f, "invalid TLS configuration: {e}"),
        }
    }
}

impl std::error::Error for TlsConfigError {}

/// Load a PEM certificate chain and key from disk.
pub fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
    http2: bool,
) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    server_config(certs, key, http2)
}

/// Build a server configuration from DER material.
///
/// ALPN advertises `h2` before `http/1.1` when HTTP/2 is enabled.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    http2: bool,
) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(TlsConfigError::Rustls)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(TlsConfigError::Rustls)?;

    config.alpn_protocols = if http2 {
        vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()]
    } else {
        vec![ALPN_HTTP11.to_vec()]
    };
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let file = File::open(path).map_err(|e| TlsConfigError::Read(path.to_path_buf(), e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsConfigError::Read(path.to_path_buf(), e))?;
    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    let file = File::open(path).map_err(|e| TlsConfigError::Read(path.to_path_buf(), e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TlsConfigError::Read(path.to_path_buf(), e))?
        .ok_or_else(|| TlsConfigError::NoPrivateKey(path.to_path_buf()))
}

/// Self-signed `localhost` certificate and key.
#[cfg(test)]
pub(crate) fn self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let der = cert.cert.der().clone();
    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    (vec![der], PrivateKeyDer::Pkcs8(key))
}

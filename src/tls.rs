//! TLS acceptor construction from PEM files.

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use crate::error::{ModbusError, ModbusResult};

/// Load a certificate chain and private key and build a server-side acceptor
///
/// # Arguments
///
/// * `cert_path` - PEM file with the certificate chain, leaf first
/// * `key_path` - PEM file with the private key (PKCS#8, PKCS#1 or SEC1)
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> ModbusResult<TlsAcceptor> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .map_err(|e| ModbusError::tls(format!("reading certificate {}: {}", cert_path.display(), e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ModbusError::tls(format!("parsing certificate {}: {}", cert_path.display(), e)))?;
    if certs.is_empty() {
        return Err(ModbusError::tls(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }

    let key = PrivateKeyDer::from_pem_file(key_path)
        .map_err(|e| ModbusError::tls(format!("reading private key {}: {}", key_path.display(), e)))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

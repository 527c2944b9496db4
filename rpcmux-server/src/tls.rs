//! TLS acceptor construction for listeners.
//!
//! The acceptor wraps whatever transport a listener accepted, so the same
//! settings work over TCP and over Unix-domain sockets.

use crate::config::TlsConfig;
use crate::error::ServerError;
use rpcmux_protocol::ALPN_PROTOCOL;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Creates a TLS acceptor from a listener's TLS settings.
pub fn create_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
    Ok(TlsAcceptor::from(Arc::new(server_config(config)?)))
}

/// Builds the rustls server configuration, advertising the rpcmux ALPN id.
pub fn server_config(config: &TlsConfig) -> Result<rustls::ServerConfig, ServerError> {
    let cert_path = config
        .cert_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("cert_path not set".into()))?;
    let key_path = config
        .key_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("key_path not set".into()))?;
    let client_ca_path = match (config.require_client_cert, config.client_ca_path.as_ref()) {
        (true, None) => {
            return Err(ServerError::TlsConfig(
                "client_ca_path not set for mTLS".into(),
            ))
        }
        (true, Some(path)) => Some(path),
        (false, _) => None,
    };

    let certs = load_certs(cert_path)?;
    if certs.is_empty() {
        return Err(ServerError::TlsConfig(format!(
            "no certificates found in {:?}",
            cert_path
        )));
    }
    let key = load_private_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let mut server_config = match client_ca_path {
        Some(ca_path) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(client_roots(ca_path)?))
                .build()
                .map_err(|e| {
                    ServerError::TlsConfig(format!("failed to build client verifier: {}", e))
                })?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| ServerError::TlsConfig(format!("invalid server cert/key: {}", e)))?;

    server_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    Ok(server_config)
}

fn client_roots(path: &Path) -> Result<RootCertStore, ServerError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| ServerError::TlsConfig(format!("invalid client CA cert: {}", e)))?;
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ServerError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        .ok_or_else(|| ServerError::TlsConfig(format!("no private key found in {:?}", path)))
}

//! TLS connector construction.

use crate::connector::TlsClientConfig;
use crate::error::ClientError;
use rpcmux_protocol::ALPN_PROTOCOL;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Creates a TLS connector and the SNI name to present for `server_host`.
///
/// With `insecure` set, the server certificate is not verified. The switch
/// lives in the config passed here and affects only connections made with it.
pub fn create_tls_connector(
    config: &TlsClientConfig,
    server_host: &str,
) -> Result<(TlsConnector, ServerName<'static>), ClientError> {
    let builder = if config.insecure {
        tracing::warn!("TLS certificate verification disabled");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(insecure::InsecureVerifier))
    } else {
        rustls::ClientConfig::builder().with_root_certificates(root_store(config)?)
    };

    let mut client_config = match (&config.client_cert_path, &config.client_key_path) {
        (Some(cert_path), Some(key_path)) => builder
            .with_client_auth_cert(load_certs(cert_path)?, load_private_key(key_path)?)
            .map_err(|e| ClientError::TlsConfig(format!("invalid client cert/key: {}", e)))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(ClientError::TlsConfig(
                "client_cert_path and client_key_path must be set together".into(),
            ))
        }
    };
    client_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let name = config.server_name.as_deref().unwrap_or(server_host);
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|_| ClientError::TlsConfig(format!("invalid server name: {}", name)))?;

    Ok((TlsConnector::from(Arc::new(client_config)), server_name))
}

fn root_store(config: &TlsClientConfig) -> Result<RootCertStore, ClientError> {
    let mut store = RootCertStore::empty();
    match &config.ca_cert_path {
        Some(ca_path) => {
            for cert in load_certs(ca_path)? {
                store
                    .add(cert)
                    .map_err(|e| ClientError::TlsConfig(format!("invalid CA cert: {}", e)))?;
            }
        }
        None => store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(store)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ClientError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        .ok_or_else(|| ClientError::TlsConfig(format!("no private key found in {:?}", path)))
}

mod insecure {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate.
    #[derive(Debug)]
    pub(super) struct InsecureVerifier;

    impl ServerCertVerifier for InsecureVerifier {
        fn verify_server_cert(
            &self,
            _: &CertificateDer<'_>,
            _: &[CertificateDer<'_>],
            _: &ServerName<'_>,
            _: &[u8],
            _: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _: &[u8],
            _: &CertificateDer<'_>,
            _: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _: &[u8],
            _: &CertificateDer<'_>,
            _: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_files() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(err.to_string().contains("cannot open"));
        let err = load_private_key(Path::new("/nonexistent/key.pem")).unwrap_err();
        assert!(err.to_string().contains("cannot open"));
    }

    #[test]
    fn test_insecure_connector_uses_host_as_sni() {
        let config = TlsClientConfig::new().with_insecure();
        let (_, name) = create_tls_connector(&config, "example.com").unwrap();
        assert!(matches!(name, ServerName::DnsName(ref dns) if dns.as_ref() == "example.com"));
    }

    #[test]
    fn test_server_name_override() {
        let config = TlsClientConfig::new()
            .with_insecure()
            .with_server_name("rpcmux.internal");
        let (_, name) = create_tls_connector(&config, "10.0.0.1").unwrap();
        assert!(matches!(name, ServerName::DnsName(ref dns) if dns.as_ref() == "rpcmux.internal"));
    }

    #[test]
    fn test_half_configured_client_cert() {
        let config = TlsClientConfig {
            client_cert_path: Some("/some/cert.pem".into()),
            ..TlsClientConfig::new().with_insecure()
        };
        match create_tls_connector(&config, "localhost") {
            Err(e) => assert!(e.to_string().contains("must be set together")),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_web_pki_roots_by_default() {
        let store = root_store(&TlsClientConfig::new()).unwrap();
        assert!(!store.is_empty());
    }
}

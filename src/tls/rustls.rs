#[cfg(feature = "tls-rustls")]
use std::{fs::File, io::BufReader, sync::Arc};

#[cfg(feature = "tls-rustls")]
use rustls::{ClientConfig, RootCertStore};

#[cfg(feature = "tls-rustls")]
use crate::config::TlsConfig;
#[cfg(feature = "tls-rustls")]
use crate::error::{NeonError, Result};

/// Client config shared by the HTTP client and the WebSocket connector.
///
/// Roots come from `ca_pem_path` when set, else from webpki-roots. The ring
/// provider is selected explicitly so the result does not depend on which
/// providers other crates in the build have enabled.
#[cfg(feature = "tls-rustls")]
pub fn build_client_config(tls: &TlsConfig) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();

    if let Some(path) = &tls.ca_pem_path {
        let f = File::open(path).map_err(|e| NeonError::Config(format!("open CA pem: {e}")))?;
        let mut rd = BufReader::new(f);
        let certs = rustls_pemfile::certs(&mut rd)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| NeonError::Config(format!("parse CA pem: {e}")))?;
        let (added, _ignored) = roots.add_parsable_certificates(certs);
        if added == 0 {
            return Err(NeonError::Config(format!(
                "no usable certificates in {}",
                path.display()
            )));
        }
    } else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut cfg = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| NeonError::Config(format!("tls protocol versions: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    if !tls.verify {
        cfg.dangerous()
            .set_certificate_verifier(Arc::new(NoVerify { provider }));
    }

    Ok(Arc::new(cfg))
}

/// Accepts any certificate but still checks handshake signatures.
#[cfg(feature = "tls-rustls")]
#[derive(Debug)]
struct NoVerify {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

#[cfg(feature = "tls-rustls")]
impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

//! TLS configuration for the QUIC transport.
//!
//! Self-signed X.509 certificates from the node's Ed25519 key via rcgen.
//! ALPN protocol: "strand/1".
//! Dialers accept any certificate: peers prove key possession in the strand
//! handshake, not through a CA chain.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified};
use rustls::pki_types::CertificateDer;

/// ALPN protocol identifier.
pub const ALPN_STRAND: &[u8] = b"strand/1";

/// SNI presented by dialers. Never verified.
pub const SERVER_NAME: &str = "strand-node.local";

pub type TlsResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Generate a self-signed X.509 certificate from an Ed25519 PKCS#8 DER keypair.
///
/// Returns (certificate DER bytes, private key DER bytes).
pub fn generate_self_signed_cert(pkcs8_der: &[u8]) -> TlsResult<(Vec<u8>, Vec<u8>)> {
    let pkcs8_key = rustls::pki_types::PrivatePkcs8KeyDer::from(pkcs8_der.to_vec());
    let key_pair = rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8_key, &rcgen::PKCS_ED25519)?;

    let mut params = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "strand-node");

    let cert = params.self_signed(&key_pair)?;

    Ok((cert.der().to_vec(), pkcs8_der.to_vec()))
}

fn transport_config() -> quinn::TransportConfig {
    let mut transport = quinn::TransportConfig::default();
    // VarInt millis; always within bounds for these constants.
    transport.max_idle_timeout(Some(
        quinn::VarInt::from_u32((crate::QUIC_IDLE_TIMEOUT_SECS * 1000) as u32).into(),
    ));
    transport.keep_alive_interval(Some(Duration::from_secs(crate::QUIC_KEEPALIVE_SECS)));
    transport
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build a QUIC server config with the given certificate and private key.
pub fn build_server_config(cert_der: Vec<u8>, key_der: Vec<u8>) -> TlsResult<quinn::ServerConfig> {
    let cert = CertificateDer::from(cert_der);
    let key = rustls::pki_types::PrivateKeyDer::try_from(key_der)
        .map_err(|e| format!("invalid private key DER: {e}"))?;

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;

    server_crypto.alpn_protocols = vec![ALPN_STRAND.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
    ));
    server_config.transport_config(Arc::new(transport_config()));

    Ok(server_config)
}

/// Build a QUIC client config that skips server certificate verification.
pub fn build_client_config() -> TlsResult<quinn::ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AnyServerCert::new()))
        .with_no_client_auth();

    client_crypto.alpn_protocols = vec![ALPN_STRAND.to_vec()];

    let mut client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
    ));
    client_config.transport_config(Arc::new(transport_config()));

    Ok(client_config)
}

/// Accepts any server certificate chain but still checks the TLS handshake
/// signatures against the presented key.
#[derive(Debug)]
struct AnyServerCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl AnyServerCert {
    fn new() -> Self {
        Self {
            provider: crypto_provider(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for AnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

//! TLS configuration for mutually authenticated instance connections.
//!
//! Instances present a server certificate whose subject carries the instance
//! identity rather than a resolvable hostname, so the usual hostname check is
//! replaced by [`InstanceIdentityVerifier`]: the chain is still validated
//! against the instance's CA, then the subject common name must equal the
//! expected instance UID.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::server::ParsedCertificate;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::fmt;
use std::sync::Arc;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Crypto provider used for every handshake
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parse every certificate in a PEM document.
///
/// # Errors
///
/// Returns a description of the problem if the PEM is malformed or holds no
/// certificate.
pub fn parse_pem_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>, String> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("failed to parse PEM certificate: {}", e))?;

    if certs.is_empty() {
        return Err("no certificates found in PEM data".to_string());
    }
    Ok(certs)
}

/// Subject common name of a DER certificate
pub fn common_name(cert: &CertificateDer<'_>) -> Option<String> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    cn
}

/// Verifies the server certificate chain and binds it to an instance UID
pub struct InstanceIdentityVerifier {
    roots: Arc<RootCertStore>,
    server_name: String,
    algorithms: WebPkiSupportedAlgorithms,
}

impl InstanceIdentityVerifier {
    /// Create a verifier trusting `roots` and expecting `server_name` as the subject CN
    pub fn new(
        roots: Arc<RootCertStore>,
        server_name: impl Into<String>,
        provider: &CryptoProvider,
    ) -> Self {
        Self {
            roots,
            server_name: server_name.into(),
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl fmt::Debug for InstanceIdentityVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceIdentityVerifier")
            .field("roots", &self.roots.len())
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl ServerCertVerifier for InstanceIdentityVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.algorithms.all,
        )?;

        match common_name(end_entity) {
            Some(cn) if cn == self.server_name => Ok(ServerCertVerified::assertion()),
            Some(cn) => Err(rustls::Error::General(format!(
                "certificate had CN {:?}, expected {:?}",
                cn, self.server_name
            ))),
            None => Err(rustls::Error::General(format!(
                "certificate has no common name, expected {:?}",
                self.server_name
            ))),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Build the client configuration for one connection info bundle.
///
/// TLS 1.3 only; the ephemeral certificate is presented as the client
/// certificate.
pub fn client_config(
    server_ca: &[CertificateDer<'static>],
    server_name: &str,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ClientConfig>, rustls::Error> {
    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(server_ca.iter().cloned());
    if added == 0 {
        return Err(rustls::Error::General(
            "no usable server CA certificate".to_string(),
        ));
    }

    let provider = crypto_provider();
    let verifier = InstanceIdentityVerifier::new(Arc::new(roots), server_name, &provider);

    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(cert_chain, key)?;

    Ok(Arc::new(config))
}

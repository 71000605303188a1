//! rustls integration for pinning policies.
//!
//! During the handshake only the handshake signatures are checked; the chain
//! itself is accepted provisionally and handed to the [`PinningPolicy`] once
//! the handshake completes, before any application data is written.
//!
//! [`PinningPolicy`]: super::PinningPolicy

use std::sync::{Arc, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use super::{PinningError, TrustChain};

/// The installed process-wide crypto provider, or ring.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Trust anchors from the platform certificate store.
///
/// The store is loaded once per process. Certificates which cannot be loaded
/// or parsed are skipped.
pub fn native_roots() -> Arc<RootCertStore> {
    static ROOTS: OnceLock<Arc<RootCertStore>> = OnceLock::new();

    ROOTS
        .get_or_init(|| {
            let loaded = rustls_native_certs::load_native_certs();
            for error in &loaded.errors {
                warn!(%error, "could not load platform certificates");
            }

            let mut roots = RootCertStore::empty();
            let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
            debug!(added, ignored, "loaded platform trust anchors");
            Arc::new(roots)
        })
        .clone()
}

/// Client configuration which defers chain trust to a pinning policy.
pub(crate) fn client_config() -> Result<ClientConfig, rustls::Error> {
    let provider = crypto_provider();
    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DeferredVerifier { provider }))
        .with_no_client_auth();

    config.alpn_protocols.push(b"http/1.1".to_vec());
    Ok(config)
}

/// Chain-of-trust and hostname evaluation against the chain's trust anchors.
pub(crate) fn evaluate_native(chain: &TrustChain) -> Result<(), PinningError> {
    let (end_entity, intermediates) = chain
        .certificates()
        .split_first()
        .ok_or(PinningError::EmptyChain)?;

    let verifier =
        WebPkiServerVerifier::builder_with_provider(chain.roots().clone(), crypto_provider())
            .build()
            .map_err(PinningError::TrustUnavailable)?;

    verifier
        .verify_server_cert(
            end_entity,
            intermediates,
            chain.server_name(),
            &[],
            chain.now(),
        )
        .map(|_| ())
        .map_err(PinningError::Evaluation)
}

/// Accepts the presented chain during the handshake, but still requires
/// valid handshake signatures from the presented end-entity key.
#[derive(Debug)]
struct DeferredVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for DeferredVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

//! Certificate pinning policies.
//!
//! A [`PinningPolicy`] decides whether the certificate chain presented by a TLS
//! peer is trusted. Policies never return their decision directly: evaluation
//! hands the decision to a [`Responder`], which may be answered later (an ad-hoc
//! verifier is free to consult something asynchronous before responding).
//!
//! The fixed-set policy compares base64 encoded SHA-256 digests of each DER
//! certificate in the chain against the pinned set. The insecure policy accepts
//! anything, but logs the digests it saw so that one of them can be pinned.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use pin_project::pin_project;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::RootCertStore;
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::DebugLiteral;

pub(crate) mod verifier;

pub use self::verifier::native_roots;

/// Errors raised while evaluating a certificate chain.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PinningError {
    /// The peer did not present any certificates.
    #[error("peer presented no certificates")]
    EmptyChain,

    /// No usable trust anchors to evaluate the chain against.
    #[error("trust anchors unavailable: {0}")]
    TrustUnavailable(#[source] rustls::client::VerifierBuilderError),

    /// The platform trust evaluation failed.
    #[error("trust evaluation failed: {0}")]
    Evaluation(#[source] rustls::Error),

    /// The policy rejected the chain.
    #[error("certificate chain rejected")]
    Rejected,

    /// The responder was dropped without a decision.
    #[error("no pinning decision was made")]
    Abandoned,
}

/// Base64 encoded SHA-256 digest of a DER encoded certificate.
pub fn certificate_digest(der: &[u8]) -> String {
    BASE64.encode(Sha256::digest(der))
}

/// The certificate chain and trust material for one connection attempt.
#[derive(Debug, Clone)]
pub struct TrustChain {
    server_name: ServerName<'static>,
    certificates: Vec<CertificateDer<'static>>,
    roots: Arc<RootCertStore>,
    now: UnixTime,
}

impl TrustChain {
    /// A chain presented by `server_name`, end-entity certificate first.
    pub fn new(
        server_name: ServerName<'static>,
        certificates: Vec<CertificateDer<'static>>,
        roots: Arc<RootCertStore>,
    ) -> Self {
        Self {
            server_name,
            certificates,
            roots,
            now: UnixTime::now(),
        }
    }

    /// Evaluate the chain as of `now` instead of the time of construction.
    pub fn at(mut self, now: UnixTime) -> Self {
        self.now = now;
        self
    }

    /// The name the peer is expected to prove.
    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }

    /// The presented certificates, end-entity first.
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    /// Trust anchors used by the normal policy.
    pub fn roots(&self) -> &Arc<RootCertStore> {
        &self.roots
    }

    /// Time at which validity is checked.
    pub fn now(&self) -> UnixTime {
        self.now
    }

    /// Digests of every certificate in the chain, in chain order.
    pub fn digests(&self) -> Vec<String> {
        self.certificates
            .iter()
            .map(|cert| certificate_digest(cert))
            .collect()
    }
}

/// Receives the accept or reject decision for a chain.
///
/// A responder is consumed when it answers, so it answers at most once.
/// Dropping it without answering counts as [`PinningError::Abandoned`].
pub struct Responder {
    respond: Box<dyn FnOnce(Result<bool, PinningError>) + Send>,
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder").finish_non_exhaustive()
    }
}

impl Responder {
    /// A responder which forwards its answer to `respond`.
    pub fn new<F>(respond: F) -> Self
    where
        F: FnOnce(Result<bool, PinningError>) + Send + 'static,
    {
        Self {
            respond: Box::new(respond),
        }
    }

    /// A responder paired with the future that resolves to its decision.
    pub fn channel() -> (Responder, Decision) {
        let (tx, rx) = oneshot::channel();
        let responder = Responder::new(move |decision| {
            let _ = tx.send(decision);
        });
        (responder, Decision { rx })
    }

    /// Accept or reject the chain.
    pub fn respond(self, accept: bool) {
        (self.respond)(Ok(accept))
    }

    /// Reject the chain with a diagnostic error.
    pub fn fail(self, error: PinningError) {
        (self.respond)(Err(error))
    }
}

/// Future resolving to the decision given to a [`Responder`].
#[derive(Debug)]
#[pin_project]
pub struct Decision {
    #[pin]
    rx: oneshot::Receiver<Result<bool, PinningError>>,
}

impl Future for Decision {
    type Output = Result<(), PinningError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let decision = ready!(self.project().rx.poll(cx));
        Poll::Ready(match decision {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(PinningError::Rejected),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(PinningError::Abandoned),
        })
    }
}

/// A caller supplied chain verifier.
pub trait VerifyChain: Send + Sync + 'static {
    /// Decide on `chain`, answering through `responder`.
    fn verify(&self, chain: &TrustChain, responder: Responder);
}

impl<F> VerifyChain for F
where
    F: Fn(&TrustChain, Responder) + Send + Sync + 'static,
{
    fn verify(&self, chain: &TrustChain, responder: Responder) {
        (self)(chain, responder)
    }
}

/// Rule used to accept or reject a peer's certificate chain.
#[derive(Clone, Default)]
pub enum PinningPolicy {
    /// Defer entirely to a caller supplied verifier.
    AdHoc(Arc<dyn VerifyChain>),

    /// Accept when any certificate in the chain has one of these digests.
    ///
    /// Digests are base64 encoded SHA-256 over the DER certificate. An empty
    /// set rejects every chain.
    Fixed(BTreeSet<String>),

    /// Accept every chain, logging the digests that could be pinned.
    Insecure,

    /// Chain-of-trust and hostname validation against the trust anchors.
    #[default]
    Normal,
}

impl fmt::Debug for PinningPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinningPolicy::AdHoc(_) => f
                .debug_tuple("AdHoc")
                .field(&DebugLiteral("<verifier>"))
                .finish(),
            PinningPolicy::Fixed(pinned) => f.debug_tuple("Fixed").field(pinned).finish(),
            PinningPolicy::Insecure => f.write_str("Insecure"),
            PinningPolicy::Normal => f.write_str("Normal"),
        }
    }
}

impl PinningPolicy {
    /// Pin a set of base64 encoded SHA-256 certificate digests.
    pub fn fixed<I, S>(digests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PinningPolicy::Fixed(digests.into_iter().map(Into::into).collect())
    }

    /// Use `verifier` to decide on each chain.
    pub fn adhoc<V: VerifyChain>(verifier: V) -> Self {
        PinningPolicy::AdHoc(Arc::new(verifier))
    }

    /// Evaluate `chain`, answering through `responder` exactly once.
    pub fn evaluate(&self, chain: &TrustChain, responder: Responder) {
        match self {
            PinningPolicy::AdHoc(verifier) => verifier.verify(chain, responder),
            _ if chain.certificates().is_empty() => {
                debug!("no certificates presented");
                responder.fail(PinningError::EmptyChain)
            }
            PinningPolicy::Fixed(pinned) if pinned.is_empty() => {
                warn!("no certificate digests are pinned, rejecting");
                responder.respond(false)
            }
            PinningPolicy::Fixed(pinned) => {
                let accepted = chain.digests().iter().any(|digest| pinned.contains(digest));
                debug!(accepted, "checked pinned certificates");
                responder.respond(accepted)
            }
            PinningPolicy::Insecure => {
                warn!(server = ?chain.server_name(), "accepting any certificate, prefer a pinned certificate");
                for digest in chain.digests() {
                    warn!(%digest, "certificate available for pinning");
                }
                responder.respond(true)
            }
            PinningPolicy::Normal => match verifier::evaluate_native(chain) {
                Ok(()) => responder.respond(true),
                Err(error) => {
                    debug!(%error, "trust evaluation failed");
                    responder.fail(error)
                }
            },
        }
    }

    /// Evaluate `chain` and wait for the decision.
    pub async fn decide(&self, chain: &TrustChain) -> Result<(), PinningError> {
        let (responder, decision) = Responder::channel();
        self.evaluate(chain, responder);
        decision.await
    }
}

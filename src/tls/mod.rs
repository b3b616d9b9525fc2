//! Instrumented TLS handshakes.
//!
//! [`TlsHandshakeFunc`] runs a client handshake over an established
//! connection through a pluggable [`TlsEngine`] and logs
//! `tlsHandshakeStart` / `tlsHandshakeDone`. The default engine is
//! [`RustlsEngine`].

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use rustls::RootCertStore;
use thiserror::Error;

use crate::config::{Clock, Config};
use crate::conn::{BoxConn, Conn};
use crate::context::Context;
use crate::errclass::{classify_opt, ErrClassifier};
use crate::error::Error;
use crate::func::Func;
use crate::info::ConnectionInfo;
use crate::slog::{self, Logger};

mod engine;

pub use self::engine::{RustlsConn, RustlsEngine};

/// Caller-owned handshake configuration.
///
/// A handshake never mutates the configuration it was given: it works on a
/// clone, so one `TlsConfig` can be shared by many pipeline runs.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Server name sent in SNI and used for certificate verification. IP
    /// address literals are verified against IP subject alternative names.
    pub server_name: String,

    /// Protocols offered through ALPN, in preference order.
    pub next_protos: Vec<String>,

    /// Accept any certificate chain. Signatures are still checked.
    pub insecure_skip_verify: bool,

    /// Trust anchors for certificate verification.
    pub root_certs: Arc<RootCertStore>,

    /// Time source for certificate validity; the system clock when unset.
    /// [`TlsHandshakeFunc`] always sets it to the configured clock.
    pub time: Option<Clock>,
}

impl TlsConfig {
    /// Configuration for `server_name`, trusting the Mozilla root program.
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            next_protos: Vec::new(),
            insecure_skip_verify: false,
            root_certs: Arc::new(RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            }),
            time: None,
        }
    }

    /// Offer `protos` through ALPN.
    pub fn with_next_protos<I, S>(mut self, protos: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next_protos = protos.into_iter().map(Into::into).collect();
        self
    }

    /// Trust exactly `roots`.
    pub fn with_root_certs(mut self, roots: RootCertStore) -> Self {
        self.root_certs = Arc::new(roots);
        self
    }

    /// Skip certificate verification.
    pub fn insecure(mut self) -> Self {
        self.insecure_skip_verify = true;
        self
    }
}

/// A certificate verification failure, carrying the offending certificate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CertificateError {
    /// The certificate does not cover the requested server name.
    #[error("x509: certificate is not valid for {server_name}")]
    HostnameMismatch {
        /// The name that was verified.
        server_name: String,
        /// DER encoding of the end-entity certificate.
        certificate: Vec<u8>,
    },

    /// The chain does not lead to a trusted root.
    #[error("x509: certificate signed by unknown authority")]
    UnknownAuthority {
        /// DER encoding of the end-entity certificate.
        certificate: Vec<u8>,
    },

    /// The certificate is invalid for another reason (expired, malformed, ...).
    #[error("x509: invalid certificate: {reason}")]
    Invalid {
        /// Why verification failed.
        reason: String,
        /// DER encoding of the end-entity certificate.
        certificate: Vec<u8>,
    },
}

impl CertificateError {
    /// DER encoding of the certificate which failed verification.
    pub fn certificate(&self) -> &[u8] {
        match self {
            CertificateError::HostnameMismatch { certificate, .. }
            | CertificateError::UnknownAuthority { certificate }
            | CertificateError::Invalid { certificate, .. } => certificate,
        }
    }
}

/// What a TLS connection knows about its session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConnectionState {
    /// Whether the handshake completed.
    pub handshake_complete: bool,

    /// ALPN protocol, if one was negotiated.
    pub negotiated_protocol: Option<String>,

    /// Cipher suite name, e.g. `TLS13_AES_128_GCM_SHA256`.
    pub cipher_suite: Option<String>,

    /// Protocol version name, e.g. `TLS 1.3`.
    pub version: Option<String>,

    /// DER-encoded peer certificates, end-entity first.
    pub peer_certificates: Vec<Vec<u8>>,
}

/// A client TLS connection produced by a [`TlsEngine`].
pub trait TlsConn: Conn {
    /// Run the handshake, aborting when `ctx` is done.
    fn handshake<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, io::Result<()>>;

    /// Session details. Empty until the handshake completes.
    fn connection_state(&self) -> TlsConnectionState;

    /// The connection the TLS session runs over.
    fn net_conn(&self) -> &dyn Conn;
}

/// A type-erased TLS connection.
pub type BoxTlsConn = Box<dyn TlsConn>;

impl<C> TlsConn for Box<C>
where
    C: TlsConn + ?Sized,
{
    fn handshake<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, io::Result<()>> {
        (**self).handshake(ctx)
    }

    fn connection_state(&self) -> TlsConnectionState {
        (**self).connection_state()
    }

    fn net_conn(&self) -> &dyn Conn {
        (**self).net_conn()
    }
}

/// Builds client TLS connections.
pub trait TlsEngine: fmt::Debug + Send + Sync {
    /// Wrap `conn` in a client connection configured by `config`. The
    /// returned connection owns `conn`; the handshake has not started.
    fn client(&self, conn: BoxConn, config: &TlsConfig) -> BoxTlsConn;

    /// Engine name for the `tlsEngineName` field.
    fn name(&self) -> &str;

    /// Fingerprint being imitated, for the `tlsParrot` field. Empty when the
    /// engine does not imitate anyone.
    fn parrot(&self) -> &str;
}

/// Performs and logs a TLS handshake.
///
/// On failure the input connection is closed before the error is returned.
#[derive(Debug, Clone)]
pub struct TlsHandshakeFunc {
    /// Handshake configuration, cloned for each handshake.
    pub config: TlsConfig,

    /// The TLS engine.
    pub engine: Arc<dyn TlsEngine>,

    /// Classifier for the `errClass` field.
    pub err_classifier: Arc<dyn ErrClassifier>,

    /// Clock for event timestamps and certificate validation.
    pub clock: Clock,

    /// Destination of the log events.
    pub logger: Logger,
}

impl TlsHandshakeFunc {
    /// Build a handshake stage using the rustls engine.
    pub fn new(config: &Config, tls: TlsConfig, logger: Logger) -> Self {
        Self {
            config: tls,
            engine: Arc::new(RustlsEngine::default()),
            err_classifier: config.err_classifier.clone(),
            clock: config.clock.clone(),
            logger,
        }
    }

    /// Replace the TLS engine.
    pub fn with_engine<E>(mut self, engine: E) -> Self
    where
        E: TlsEngine + 'static,
    {
        self.engine = Arc::new(engine);
        self
    }
}

impl Func<BoxConn> for TlsHandshakeFunc {
    type Output = BoxTlsConn;

    fn call<'a>(&'a self, ctx: &'a Context, conn: BoxConn) -> BoxFuture<'a, Result<BoxTlsConn, Error>> {
        Box::pin(async move {
            let mut config = self.config.clone();
            config.time = Some(self.clock.clone());

            let info = ConnectionInfo::of(&*conn);
            let t0 = self.clock.now();
            tracing::info!(
                parent: self.logger.span(),
                deadline = %slog::deadline(ctx.deadline()),
                localAddr = %info.local(),
                protocol = info.protocol(),
                remoteAddr = %info.remote(),
                t = %slog::timestamp(t0),
                tlsEngineName = self.engine.name(),
                tlsOfferedProtocols = ?config.next_protos,
                tlsParrot = self.engine.parrot(),
                tlsServerName = %config.server_name,
                tlsSkipVerify = config.insecure_skip_verify,
                "tlsHandshakeStart"
            );

            let tls = self.engine.client(conn, &config);
            let result = tls.handshake(ctx).await;
            let state = tls.connection_state();

            let err = result
                .as_ref()
                .err()
                .map(|err| err as &(dyn StdError + 'static));
            let peer_certs: Vec<String> = peer_certificates(err, &state)
                .iter()
                .map(|cert| slog::bytes(cert))
                .collect();
            tracing::info!(
                parent: self.logger.span(),
                err = %slog::error_message(err),
                errClass = %classify_opt(self.err_classifier.as_ref(), err),
                localAddr = %info.local(),
                protocol = info.protocol(),
                remoteAddr = %info.remote(),
                t0 = %slog::timestamp(t0),
                t = %slog::timestamp(self.clock.now()),
                tlsCipherSuite = %state.cipher_suite.as_deref().unwrap_or_default(),
                tlsNegotiatedProtocol = %state.negotiated_protocol.as_deref().unwrap_or_default(),
                tlsPeerCerts = ?peer_certs,
                tlsVersion = %state.version.as_deref().unwrap_or_default(),
                "tlsHandshakeDone"
            );

            match result {
                Ok(()) => Ok(tls),
                Err(err) => {
                    let _ = tls.close();
                    Err(Error::Tls(err))
                }
            }
        })
    }
}

/// The certificates to log for a handshake outcome.
///
/// A certificate attached to a verification error wins, looking for a
/// hostname mismatch first, then an unknown authority, then any other invalid
/// certificate. Otherwise the chain from the connection state is used.
pub(crate) fn peer_certificates(
    err: Option<&(dyn StdError + 'static)>,
    state: &TlsConnectionState,
) -> Vec<Vec<u8>> {
    if let Some(err) = err {
        let shapes: [fn(&CertificateError) -> bool; 3] = [
            |e| matches!(e, CertificateError::HostnameMismatch { .. }),
            |e| matches!(e, CertificateError::UnknownAuthority { .. }),
            |e| matches!(e, CertificateError::Invalid { .. }),
        ];
        for shape in shapes {
            if let Some(cert) = find_certificate_error(err, shape) {
                return vec![cert.certificate().to_vec()];
            }
        }
    }
    state.peer_certificates.clone()
}

fn find_certificate_error<'e>(
    mut err: &'e (dyn StdError + 'static),
    matches: fn(&CertificateError) -> bool,
) -> Option<&'e CertificateError> {
    loop {
        if let Some(cert) = err.downcast_ref::<CertificateError>() {
            if matches(cert) {
                return Some(cert);
            }
        }

        let next = match err.downcast_ref::<io::Error>() {
            Some(io) => io.get_ref().map(|inner| inner as &(dyn StdError + 'static)),
            None => err.source(),
        };
        err = next?;
    }
}

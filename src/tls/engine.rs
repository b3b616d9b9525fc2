//! TLS engine backed by rustls.

use std::fmt;
use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{self, ready, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ProtocolVersion, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::client::TlsStream;

use super::{BoxTlsConn, CertificateError, TlsConfig, TlsConn, TlsConnectionState, TlsEngine};
use crate::config::Clock;
use crate::conn::{BoxConn, CloseOnce, Conn, ConnIo};
use crate::context::{Context, ContextError};
use crate::error::closed;
use crate::info::Network;

/// The default [`TlsEngine`], backed by rustls with the ring provider.
#[derive(Debug, Clone)]
pub struct RustlsEngine {
    provider: Arc<CryptoProvider>,
}

impl RustlsEngine {
    /// An engine using `provider` for cryptography.
    pub fn new(provider: CryptoProvider) -> Self {
        Self {
            provider: Arc::new(provider),
        }
    }
}

impl Default for RustlsEngine {
    fn default() -> Self {
        Self::new(rustls::crypto::ring::default_provider())
    }
}

impl TlsEngine for RustlsEngine {
    fn client(&self, conn: BoxConn, config: &TlsConfig) -> BoxTlsConn {
        Box::new(RustlsConn::new(conn, config, self.provider.clone()))
    }

    fn name(&self) -> &str {
        "rustls"
    }

    fn parrot(&self) -> &str {
        ""
    }
}

type Certificates = Arc<Mutex<Vec<CertificateDer<'static>>>>;

/// Verifier which remembers the chain it was shown and validates against the
/// configured clock.
#[derive(Debug)]
struct RecordingVerifier {
    webpki: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    time: Option<Clock>,
    seen: Certificates,
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        {
            let mut seen = self.seen.lock();
            seen.clear();
            seen.push(end_entity.clone().into_owned());
            seen.extend(intermediates.iter().map(|cert| cert.clone().into_owned()));
        }

        let now = match &self.time {
            Some(clock) => UnixTime::since_unix_epoch(
                clock.now().duration_since(UNIX_EPOCH).unwrap_or_default(),
            ),
            None => now,
        };

        match &self.webpki {
            Some(webpki) => {
                webpki.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            }
            None => Ok(ServerCertVerified::assertion()),
        }
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

fn client_config(
    config: &TlsConfig,
    provider: Arc<CryptoProvider>,
    seen: Certificates,
) -> Result<Arc<ClientConfig>, rustls::Error> {
    let webpki = if config.insecure_skip_verify {
        None
    } else {
        let verifier =
            WebPkiServerVerifier::builder_with_provider(config.root_certs.clone(), provider.clone())
                .build()
                .map_err(|err| rustls::Error::General(err.to_string()))?;
        Some(verifier)
    };

    let verifier = RecordingVerifier {
        webpki,
        provider: provider.clone(),
        time: config.time.clone(),
        seen,
    };

    let mut client = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    client.alpn_protocols = config
        .next_protos
        .iter()
        .map(|proto| proto.as_bytes().to_vec())
        .collect();
    Ok(Arc::new(client))
}

type Io = ConnIo<Arc<dyn Conn>>;

enum State {
    Invalid(Option<io::Error>),
    Handshake(tokio_rustls::Connect<Io>),
    Streaming(Box<TlsStream<Io>>),
    Failed,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Invalid(_) => f.write_str("State::Invalid"),
            State::Handshake(_) => f.write_str("State::Handshake"),
            State::Streaming(_) => f.write_str("State::Streaming"),
            State::Failed => f.write_str("State::Failed"),
        }
    }
}

/// A client TLS connection built by [`RustlsEngine`].
///
/// Reads and writes before [`handshake`](TlsConn::handshake) drive the
/// handshake first. Closing closes the underlying connection without sending
/// `close_notify`.
pub struct RustlsConn {
    raw: Arc<dyn Conn>,
    server_name: String,
    state: Mutex<State>,
    seen: Certificates,
    close: CloseOnce,
}

impl fmt::Debug for RustlsConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsConn")
            .field("raw", &self.raw)
            .field("server_name", &self.server_name)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl RustlsConn {
    fn new(conn: BoxConn, config: &TlsConfig, provider: Arc<CryptoProvider>) -> Self {
        let raw: Arc<dyn Conn> = Arc::from(conn);
        let seen = Certificates::default();

        let connect = client_config(config, provider, seen.clone())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
            .and_then(|client| {
                let server_name = ServerName::try_from(config.server_name.clone())
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
                Ok(tokio_rustls::TlsConnector::from(client)
                    .connect(server_name, ConnIo::new(raw.clone())))
            });

        let state = match connect {
            Ok(connect) => State::Handshake(connect),
            Err(err) => State::Invalid(Some(err)),
        };

        Self {
            raw,
            server_name: config.server_name.clone(),
            state: Mutex::new(state),
            seen,
            close: CloseOnce::new(),
        }
    }

    fn poll_handshake(&self, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Streaming(_) => Poll::Ready(Ok(())),
            State::Handshake(connect) => {
                let result = ready!(Pin::new(connect).poll(cx));
                match result {
                    Ok(stream) => {
                        *state = State::Streaming(Box::new(stream));
                        Poll::Ready(Ok(()))
                    }
                    Err(err) => {
                        *state = State::Failed;
                        Poll::Ready(Err(self.certificate_error(err)))
                    }
                }
            }
            State::Invalid(err) => {
                let err = err
                    .take()
                    .unwrap_or_else(|| io::Error::other("invalid tls configuration"));
                *state = State::Failed;
                Poll::Ready(Err(err))
            }
            State::Failed => Poll::Ready(Err(io::Error::other("tls handshake already failed"))),
        }
    }

    /// Attach the recorded end-entity certificate to verification failures.
    fn certificate_error(&self, err: io::Error) -> io::Error {
        let Some(rustls::Error::InvalidCertificate(cert_err)) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        else {
            return err;
        };

        let certificate = self
            .seen
            .lock()
            .first()
            .map(|cert| cert.as_ref().to_vec())
            .unwrap_or_default();

        // Newer rustls releases add context-carrying variants, so match on the
        // variant name.
        let shape = format!("{cert_err:?}");
        let mapped = if shape.starts_with("NotValidForName") {
            CertificateError::HostnameMismatch {
                server_name: self.server_name.clone(),
                certificate,
            }
        } else if shape.starts_with("UnknownIssuer") {
            CertificateError::UnknownAuthority { certificate }
        } else {
            CertificateError::Invalid {
                reason: cert_err.to_string(),
                certificate,
            }
        };

        io::Error::new(err.kind(), mapped)
    }

    fn poll_stream<R>(
        &self,
        cx: &mut task::Context<'_>,
        op: impl FnOnce(Pin<&mut TlsStream<Io>>, &mut task::Context<'_>) -> Poll<io::Result<R>>,
    ) -> Poll<io::Result<R>> {
        if self.close.is_closed() {
            return Poll::Ready(Err(closed()));
        }
        ready!(self.poll_handshake(cx))?;

        let mut state = self.state.lock();
        match &mut *state {
            State::Streaming(stream) => op(Pin::new(stream.as_mut()), cx),
            _ => Poll::Ready(Err(closed())),
        }
    }
}

impl TlsConn for RustlsConn {
    fn handshake<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                result = poll_fn(|cx| self.poll_handshake(cx)) => result,
                _ = ctx.done() => Err(ctx.err().unwrap_or(ContextError::Canceled).into()),
            }
        })
    }

    fn connection_state(&self) -> TlsConnectionState {
        let state = self.state.lock();
        let State::Streaming(stream) = &*state else {
            // A failed handshake may still have received the server's chain.
            return TlsConnectionState {
                peer_certificates: self
                    .seen
                    .lock()
                    .iter()
                    .map(|cert| cert.as_ref().to_vec())
                    .collect(),
                ..TlsConnectionState::default()
            };
        };

        let (_, session) = stream.get_ref();
        TlsConnectionState {
            handshake_complete: true,
            negotiated_protocol: session
                .alpn_protocol()
                .map(|proto| String::from_utf8_lossy(proto).into_owned()),
            cipher_suite: session
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite())),
            version: session.protocol_version().map(version_name),
            peer_certificates: session
                .peer_certificates()
                .map(|certs| certs.iter().map(|cert| cert.as_ref().to_vec()).collect())
                .unwrap_or_default(),
        }
    }

    fn net_conn(&self) -> &dyn Conn {
        self.raw.as_ref()
    }
}

fn version_name(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::TLSv1_0 => "TLS 1.0".to_owned(),
        ProtocolVersion::TLSv1_1 => "TLS 1.1".to_owned(),
        ProtocolVersion::TLSv1_2 => "TLS 1.2".to_owned(),
        ProtocolVersion::TLSv1_3 => "TLS 1.3".to_owned(),
        other => format!("{other:?}"),
    }
}

impl Conn for RustlsConn {
    fn poll_read(
        &self,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.poll_stream(cx, |stream, cx| stream.poll_read(cx, buf))
    }

    fn poll_write(&self, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.poll_stream(cx, |stream, cx| stream.poll_write(cx, buf))
    }

    fn poll_flush(&self, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        self.poll_stream(cx, |stream, cx| stream.poll_flush(cx))
    }

    fn close(&self) -> io::Result<()> {
        self.close.close(|| self.raw.close())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.raw.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.raw.remote_addr()
    }

    fn network(&self) -> Network {
        self.raw.network()
    }

    fn set_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.raw.set_deadline(deadline)
    }

    fn set_read_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.raw.set_read_deadline(deadline)
    }

    fn set_write_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.raw.set_write_deadline(deadline)
    }
}

//! HTTP over an established connection.
//!
//! [`HttpConnFunc`] turns the output of a connect or TLS handshake stage into
//! an [`HttpConn`]. The transport is picked from the negotiated ALPN protocol:
//! `h2` gets a multiplexed HTTP/2 client, anything else a single-request
//! HTTP/1.1 client with keep-alives disabled. Either way the transport dials
//! through a [`SingleUseDialer`] holding the pipeline's connection, so it can
//! never open a connection of its own.
//!
//! Round trips are logged as `httpRoundTripStart` / `httpRoundTripDone`, and
//! response bodies are wrapped in an [`ObservedBody`].

use std::error::Error as StdError;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures_util::future::BoxFuture;
use http::header::{HeaderValue, CONNECTION, HOST};
use http::uri::{Port, Uri};
use http::{Request, Response, Version};
use hyper::client::conn::{http1, http2};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::AbortHandle;

use crate::body::Body;
use crate::bridge::{HyperIo, TokioExecutor};
use crate::config::{Clock, Config};
use crate::conn::{BoxConn, Conn};
use crate::context::{Context, ContextError};
use crate::errclass::{classify_opt, ErrClassifier};
use crate::error::Error;
use crate::func::Func;
use crate::info::ConnectionInfo;
use crate::slog::{self, Logger};
use crate::tls::BoxTlsConn;

mod body;
mod dial;

pub use self::body::ObservedBody;
pub use self::dial::SingleUseDialer;

/// The request URI names no host, and no `Host` header was set.
#[derive(Debug, Clone, Copy, Error)]
#[error("http request has no host")]
pub struct MissingHost;

/// A connection an [`HttpConn`] can run over.
///
/// Implemented for plain connections, which never negotiate a protocol, and
/// for TLS connections, which report the ALPN protocol of their session.
pub trait HttpStream: Send + 'static {
    /// The ALPN protocol negotiated on this connection, if any.
    fn negotiated_protocol(&self) -> Option<String>;

    /// Give up the connection to the transport.
    fn into_conn(self) -> Arc<dyn Conn>;
}

impl HttpStream for BoxConn {
    fn negotiated_protocol(&self) -> Option<String> {
        None
    }

    fn into_conn(self) -> Arc<dyn Conn> {
        Arc::from(self)
    }
}

impl HttpStream for BoxTlsConn {
    fn negotiated_protocol(&self) -> Option<String> {
        self.connection_state().negotiated_protocol
    }

    fn into_conn(self) -> Arc<dyn Conn> {
        Arc::new(self)
    }
}

/// Wraps a connection into an [`HttpConn`].
///
/// The caller is responsible for closing the returned connection.
pub struct HttpConnFunc<T> {
    /// Classifier for the `errClass` field.
    pub err_classifier: Arc<dyn ErrClassifier>,

    /// Clock for event timestamps.
    pub clock: Clock,

    /// Destination of the log events.
    pub logger: Logger,

    stream: PhantomData<fn(T)>,
}

impl<T> fmt::Debug for HttpConnFunc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnFunc")
            .field("err_classifier", &self.err_classifier)
            .field("clock", &self.clock)
            .field("logger", &self.logger)
            .finish()
    }
}

impl<T> Clone for HttpConnFunc<T> {
    fn clone(&self) -> Self {
        Self {
            err_classifier: self.err_classifier.clone(),
            clock: self.clock.clone(),
            logger: self.logger.clone(),
            stream: PhantomData,
        }
    }
}

impl<T> HttpConnFunc<T> {
    /// Build an HTTP stage.
    pub fn new(config: &Config, logger: Logger) -> Self {
        Self {
            err_classifier: config.err_classifier.clone(),
            clock: config.clock.clone(),
            logger,
            stream: PhantomData,
        }
    }
}

impl HttpConnFunc<BoxConn> {
    /// An HTTP stage following a connect stage.
    pub fn plain(config: &Config, logger: Logger) -> Self {
        Self::new(config, logger)
    }
}

impl HttpConnFunc<BoxTlsConn> {
    /// An HTTP stage following a TLS handshake stage.
    pub fn tls(config: &Config, logger: Logger) -> Self {
        Self::new(config, logger)
    }
}

impl<T> Func<T> for HttpConnFunc<T>
where
    T: HttpStream,
{
    type Output = HttpConn;

    fn call<'a>(&'a self, _ctx: &'a Context, stream: T) -> BoxFuture<'a, Result<HttpConn, Error>> {
        let version = match stream.negotiated_protocol().as_deref() {
            Some("h2") => Version::HTTP_2,
            _ => Version::HTTP_11,
        };
        tracing::trace!(?version, "selected http transport");

        let conn = HttpConn::new(
            stream.into_conn(),
            version,
            self.err_classifier.clone(),
            self.clock.clone(),
            self.logger.clone(),
        );
        Box::pin(async move { Ok(conn) })
    }
}

/// An HTTP transport bound to one connection.
///
/// Cloning is cheap and clones share the connection. HTTP/2 connections carry
/// any number of round trips; HTTP/1.1 connections carry exactly one, and any
/// further round trip fails with [`Error::SingleUseDial`].
#[derive(Clone)]
pub struct HttpConn {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Arc<dyn Conn>,
    info: ConnectionInfo,
    version: Version,
    dialer: SingleUseDialer,
    h2: tokio::sync::Mutex<Option<http2::SendRequest<Body>>>,
    drivers: Mutex<Vec<AbortHandle>>,
    closed: crate::conn::CloseOnce,
    err_classifier: Arc<dyn ErrClassifier>,
    clock: Clock,
    logger: Logger,
}

impl fmt::Debug for HttpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConn")
            .field("conn", &self.inner.conn)
            .field("version", &self.inner.version)
            .field("dialer", &self.inner.dialer)
            .finish()
    }
}

impl HttpConn {
    fn new(
        conn: Arc<dyn Conn>,
        version: Version,
        err_classifier: Arc<dyn ErrClassifier>,
        clock: Clock,
        logger: Logger,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                info: ConnectionInfo::of(conn.as_ref()),
                dialer: SingleUseDialer::new(conn.clone()),
                conn,
                version,
                h2: tokio::sync::Mutex::new(None),
                drivers: Mutex::new(Vec::new()),
                closed: crate::conn::CloseOnce::new(),
                err_classifier,
                clock,
                logger,
            }),
        }
    }

    /// The connection this transport runs over, for metadata.
    pub fn conn(&self) -> &dyn Conn {
        self.inner.conn.as_ref()
    }

    /// The HTTP version selected for this connection.
    pub fn version(&self) -> Version {
        self.inner.version
    }

    /// The dialer the transport is bound to.
    pub fn dialer(&self) -> &SingleUseDialer {
        &self.inner.dialer
    }

    /// Send `request` and wait for the response head.
    ///
    /// The response body is an [`ObservedBody`]; close or drop it when done.
    pub async fn round_trip(
        &self,
        ctx: &Context,
        request: Request<Body>,
    ) -> Result<Response<ObservedBody>, Error> {
        let inner = &self.inner;
        let method = request.method().clone();
        let url = request.uri().to_string();
        let request_headers = request.headers().clone();
        let deadline = slog::deadline(ctx.deadline());

        let t0 = inner.clock.now();
        tracing::info!(
            parent: inner.logger.span(),
            deadline = %deadline,
            httpMethod = %method,
            httpUrl = %url,
            httpRequestHeaders = ?request_headers,
            localAddr = %inner.info.local(),
            protocol = inner.info.protocol(),
            remoteAddr = %inner.info.remote(),
            t = %slog::timestamp(t0),
            "httpRoundTripStart"
        );

        let result = tokio::select! {
            biased;
            result = self.send(ctx, request) => result,
            _ = ctx.done() => Err(Error::Context(ctx.err().unwrap_or(ContextError::Canceled))),
        };

        let err = result
            .as_ref()
            .err()
            .map(|err| err as &(dyn StdError + 'static));
        let (status, response_headers) = match &result {
            Ok(response) => (response.status().as_u16(), response.headers().clone()),
            Err(_) => (0, Default::default()),
        };
        tracing::info!(
            parent: inner.logger.span(),
            deadline = %deadline,
            err = %slog::error_message(err),
            errClass = %classify_opt(inner.err_classifier.as_ref(), err),
            httpMethod = %method,
            httpUrl = %url,
            httpRequestHeaders = ?request_headers,
            httpResponseHeaders = ?response_headers,
            httpResponseStatusCode = status,
            localAddr = %inner.info.local(),
            protocol = inner.info.protocol(),
            remoteAddr = %inner.info.remote(),
            t0 = %slog::timestamp(t0),
            t = %slog::timestamp(inner.clock.now()),
            "httpRoundTripDone"
        );

        let response = result?;
        Ok(response.map(|body| {
            ObservedBody::new(
                body,
                inner.info.clone(),
                inner.err_classifier.clone(),
                inner.clock.clone(),
                inner.logger.clone(),
            )
        }))
    }

    async fn send(
        &self,
        ctx: &Context,
        mut request: Request<Body>,
    ) -> Result<Response<hyper::body::Incoming>, Error> {
        if self.inner.closed.is_closed() {
            return Err(crate::error::closed().into());
        }

        if self.inner.version == Version::HTTP_2 {
            let mut sender = self.h2_sender(ctx).await?;
            *request.version_mut() = Version::HTTP_2;
            sender.ready().await?;
            return Ok(sender.send_request(request).await?);
        }

        prepare_h1(&mut request)?;
        let conn = self.inner.dialer.take()?;
        let (mut sender, driver) = http1::Builder::new()
            .handshake(HyperIo::new(conn))
            .await?;
        self.spawn_driver(async move {
            if let Err(err) = driver.await {
                if err.is_user() {
                    tracing::error!(%err, "h1 connection driver error");
                } else {
                    tracing::debug!(%err, "h1 connection driver error");
                }
            }
        });
        sender.ready().await?;
        Ok(sender.send_request(request).await?)
    }

    async fn h2_sender(&self, _ctx: &Context) -> Result<http2::SendRequest<Body>, Error> {
        let mut slot = self.inner.h2.lock().await;
        if let Some(sender) = slot.as_ref() {
            return Ok(sender.clone());
        }

        tracing::trace!("handshake h2");
        let conn = self.inner.dialer.take()?;
        let (sender, driver) = http2::Builder::new(TokioExecutor::new())
            .handshake(HyperIo::new(conn))
            .await?;
        self.spawn_driver(async move {
            if let Err(err) = driver.await {
                if err.is_user() {
                    tracing::error!(%err, "h2 connection driver error");
                } else {
                    tracing::debug!(%err, "h2 connection driver error");
                }
            }
        });
        *slot = Some(sender.clone());
        Ok(sender)
    }

    fn spawn_driver<F>(&self, driver: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(driver);
        self.inner.drivers.lock().push(handle.abort_handle());
    }

    /// Stop the transport and close the connection.
    ///
    /// Only the first call has an effect; later calls report
    /// [`ConnectionClosed`](crate::ConnectionClosed).
    pub fn close(&self) -> Result<(), Error> {
        self.inner.closed.close(|| {
            for driver in self.inner.drivers.lock().drain(..) {
                driver.abort();
            }
            self.inner.conn.close()
        })?;
        Ok(())
    }
}

/// Round trips as a [`tower::Service`]. The [`Context`] is taken from the
/// request extensions, defaulting to [`Context::background`].
impl tower::Service<Request<Body>> for HttpConn {
    type Response = Response<ObservedBody>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let conn = self.clone();
        Box::pin(async move {
            let ctx = request
                .extensions()
                .get::<Context>()
                .cloned()
                .unwrap_or_else(Context::background);
            conn.round_trip(&ctx, request).await
        })
    }
}

/// Shape an HTTP/1.1 request for a connection which will not be reused.
fn prepare_h1<B>(request: &mut Request<B>) -> Result<(), MissingHost> {
    set_host_header(request)?;
    origin_form(request.uri_mut());
    *request.version_mut() = Version::HTTP_11;
    request
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    Ok(())
}

/// Convert the URI to origin-form: just the path and query.
fn origin_form(uri: &mut Uri) {
    let path = match uri.path_and_query() {
        Some(path) if path.as_str() != "/" => {
            let mut parts = http::uri::Parts::default();
            parts.path_and_query = Some(path.clone());
            Uri::from_parts(parts).unwrap_or_default()
        }
        _none_or_just_slash => Uri::default(),
    };
    *uri = path
}

/// Returns the port if it is not the default port for the scheme.
fn get_non_default_port(uri: &Uri) -> Option<Port<&str>> {
    match (uri.port().map(|p| p.as_u16()), is_schema_secure(uri)) {
        (Some(443), true) => None,
        (Some(80), false) => None,
        _ => uri.port(),
    }
}

fn is_schema_secure(uri: &Uri) -> bool {
    uri.scheme_str()
        .map(|scheme| matches!(scheme, "https" | "wss"))
        .unwrap_or_default()
}

/// Set the Host header from the URI authority, unless already set.
fn set_host_header<B>(request: &mut Request<B>) -> Result<(), MissingHost> {
    if request.headers().contains_key(HOST) {
        return Ok(());
    }

    let uri = request.uri();
    let host = uri.host().ok_or(MissingHost)?;
    let value = match get_non_default_port(uri) {
        Some(port) => HeaderValue::from_str(&format!("{host}:{port}")),
        None => HeaderValue::from_str(host),
    }
    .map_err(|_| MissingHost)?;
    request.headers_mut().insert(HOST, value);
    Ok(())
}

impl From<MissingHost> for Error {
    fn from(err: MissingHost) -> Self {
        Error::other(err)
    }
}

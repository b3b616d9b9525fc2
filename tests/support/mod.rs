#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::SystemTime;

use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use hickory_proto::serialize::binary::{BinDecodable as _, BinEncodable as _};
use http::header::CONTENT_TYPE;
use http::{Method, Request, Response};
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use netops::bridge::TokioExecutor;
use netops::{Conn, NetConn, Network};
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_rustls::TlsAcceptor;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt as _};
use tracing_subscriber::Layer;

/// Events captured by [`capture_events`].
#[derive(Debug, Clone, Default)]
pub struct Captured {
    events: Arc<Mutex<Vec<(String, HashMap<String, String>)>>>,
}

impl Captured {
    /// Names of pipeline events, skipping free-form diagnostics.
    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(name, _)| name.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|(n, _)| n == name).count()
    }

    /// The value of `field` on the first event called `name`.
    pub fn field(&self, name: &str, field: &str) -> Option<String> {
        self.events
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, fields)| fields.get(field).cloned())
    }

    /// True if `expected` appear in order among the event names.
    pub fn in_order(&self, expected: &[&str]) -> bool {
        let names = self.names();
        let mut names = names.iter();
        expected
            .iter()
            .all(|want| names.any(|name| name == want))
    }
}

struct CaptureLayer(Captured);

#[derive(Default)]
struct FieldVisitor {
    name: String,
    fields: HashMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record(field, format!("{value:?}"));
    }
}

impl FieldVisitor {
    fn record(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.name = value;
        } else {
            self.fields.insert(field.name().to_owned(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.0.events.lock().push((visitor.name, visitor.fields));
    }
}

/// Capture events emitted on this thread until the guard is dropped.
pub fn capture_events() -> (Captured, DefaultGuard) {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::registry()
        .with(CaptureLayer(captured.clone()))
        .with(tracing_subscriber::filter::LevelFilter::DEBUG);
    let guard = tracing::subscriber::set_default(subscriber);
    (captured, guard)
}

/// A throwaway certificate authority and a leaf certificate it signed.
pub struct Pki {
    pub roots: RootCertStore,
    pub leaf: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
}

impl Pki {
    /// A leaf valid for `names`, signed by a fresh root.
    pub fn new(names: &[&str]) -> Self {
        use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "netops test root");
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
        let leaf = CertificateParams::new(names)
            .unwrap()
            .signed_by(&leaf_key, &ca, &ca_key)
            .unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(ca.der().clone()).unwrap();

        Self {
            roots,
            leaf: leaf.der().clone(),
            key: PrivatePkcs8KeyDer::from(leaf_key.serialize_der()),
        }
    }

    /// A server configuration presenting the leaf and offering `alpn`.
    pub fn server_config(&self, alpn: &[&str]) -> Arc<ServerConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![self.leaf.clone()],
                PrivateKeyDer::Pkcs8(self.key.clone_key()),
            )
            .unwrap();
        config.alpn_protocols = alpn.iter().map(|proto| proto.as_bytes().to_vec()).collect();
        Arc::new(config)
    }
}

/// Adapts a tokio stream to hyper's I/O traits, for the test servers.
pub struct TokioIo<T>(pub T);

impl<T> hyper::rt::Read for TokioIo<T>
where
    T: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let mut scratch = [0u8; 8192];
        let len = buf.remaining().min(scratch.len());
        let mut read = ReadBuf::new(&mut scratch[..len]);
        ready!(Pin::new(&mut self.get_mut().0).poll_read(cx, &mut read))?;
        buf.put_slice(read.filled());
        Poll::Ready(Ok(()))
    }
}

impl<T> hyper::rt::Write for TokioIo<T>
where
    T: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

/// Addresses returned by every test DNS server, deliberately unsorted.
pub const DNS_ANSWERS: [Ipv4Addr; 2] = [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)];

/// Answer `raw_query` with [`DNS_ANSWERS`].
pub fn dns_answer(raw_query: &[u8]) -> Vec<u8> {
    let query = Message::from_bytes(raw_query).unwrap();
    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError)
        .add_queries(query.queries().to_vec());
    let name = query.queries()[0].name().clone();
    for addr in DNS_ANSWERS {
        response.add_answer(Record::from_rdata(name.clone(), 60, RData::A(A(addr))));
    }
    response.to_bytes().unwrap()
}

/// A DNS server on a local UDP socket.
pub async fn udp_dns_server() -> SocketAddr {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&dns_answer(&buf[..n]), peer).await;
        }
    });
    addr
}

async fn serve_dns_stream<S>(mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let Ok(length) = stream.read_u16().await else {
            return;
        };
        let mut query = vec![0u8; usize::from(length)];
        if stream.read_exact(&mut query).await.is_err() {
            return;
        }
        let response = dns_answer(&query);
        let mut frame = (response.len() as u16).to_be_bytes().to_vec();
        frame.extend_from_slice(&response);
        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

/// A DNS server over TCP, or over TLS when `tls` is set.
pub async fn stream_dns_server(tls: Option<Arc<ServerConfig>>) -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tls = tls.clone();
            tokio::spawn(async move {
                match tls {
                    Some(config) => {
                        if let Ok(stream) = TlsAcceptor::from(config).accept(stream).await {
                            serve_dns_stream(stream).await;
                        }
                    }
                    None => serve_dns_stream(stream).await,
                }
            });
        }
    });
    addr
}

async fn handle(request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let version = format!("{:?}", request.version());
    if request.method() == Method::POST && request.uri().path() == "/dns-query" {
        let raw_query = request
            .into_body()
            .collect()
            .await
            .map(|body| body.to_bytes())
            .unwrap_or_default();
        let response = Response::builder()
            .header(CONTENT_TYPE, "application/dns-message")
            .header("x-version", version)
            .body(Full::new(Bytes::from(dns_answer(&raw_query))))
            .unwrap();
        return Ok(response);
    }

    let response = Response::builder()
        .header("x-version", version)
        .body(Full::new(Bytes::from_static(b"hello, world")))
        .unwrap();
    Ok(response)
}

async fn serve_http<S>(stream: S, h2: bool)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo(stream);
    if h2 {
        let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
            .serve_connection(io, service_fn(handle))
            .await;
    } else {
        let _ = hyper::server::conn::http1::Builder::new()
            .serve_connection(io, service_fn(handle))
            .await;
    }
}

/// An HTTP server answering `GET` with a greeting and `POST /dns-query` with
/// a DNS response. Over TLS, HTTP/2 is served when negotiated through ALPN.
pub async fn http_server(tls: Option<Arc<ServerConfig>>) -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tls = tls.clone();
            tokio::spawn(async move {
                match tls {
                    Some(config) => {
                        let Ok(stream) = TlsAcceptor::from(config).accept(stream).await else {
                            return;
                        };
                        let h2 = stream.get_ref().1.alpn_protocol() == Some(b"h2");
                        serve_http(stream, h2).await;
                    }
                    None => serve_http(stream, false).await,
                }
            });
        }
    });
    addr
}

/// A connection counting how often it is closed.
#[derive(Debug, Clone)]
pub struct TrackedConn {
    inner: Arc<NetConn>,
    closes: Arc<AtomicUsize>,
}

impl TrackedConn {
    /// Connect to `addr` over TCP.
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            inner: Arc::new(NetConn::tcp(stream)),
            closes: Arc::default(),
        }
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// The connection beneath the tracker.
    pub fn inner(&self) -> &NetConn {
        &self.inner
    }

    pub fn boxed(&self) -> netops::BoxConn {
        Box::new(self.clone())
    }
}

impl Conn for TrackedConn {
    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_read(cx, buf)
    }

    fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.inner.poll_write(cx, buf)
    }

    fn poll_flush(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_flush(cx)
    }

    fn close(&self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr()
    }

    fn network(&self) -> Network {
        self.inner.network()
    }

    fn set_read_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.inner.set_read_deadline(deadline)
    }

    fn set_write_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.inner.set_write_deadline(deadline)
    }
}

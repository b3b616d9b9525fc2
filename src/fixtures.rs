//! Test doubles shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{self, Poll};
use std::time::SystemTime;

use futures_util::future::BoxFuture;
use futures_util::task::AtomicWaker;
use parking_lot::Mutex;
use tokio::io::ReadBuf;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt as _};
use tracing_subscriber::Layer;

use crate::conn::{BoxConn, Conn};
use crate::context::Context;
use crate::error::closed;
use crate::info::Network;
use crate::tls::{BoxTlsConn, TlsConn, TlsConnectionState};
use crate::Dialer;

#[derive(Debug, Default)]
struct MockState {
    closed: bool,
    input: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    deadlines: Vec<(&'static str, Option<SystemTime>)>,
}

/// In-memory connection recording every call made on it.
#[derive(Debug, Clone)]
pub(crate) struct MockConn {
    state: Arc<Mutex<MockState>>,
    close_calls: Arc<AtomicUsize>,
    waker: Arc<AtomicWaker>,
    network: Network,
}

impl MockConn {
    pub(crate) fn new(network: Network) -> Self {
        Self {
            state: Arc::default(),
            close_calls: Arc::default(),
            waker: Arc::default(),
            network,
        }
    }

    pub(crate) fn tcp() -> Self {
        Self::new(Network::Tcp)
    }

    /// Queue bytes for the next reads. A read never spans two feeds, so
    /// each feed behaves like one datagram.
    pub(crate) fn feed(&self, data: &[u8]) {
        self.state.lock().input.push_back(data.to_vec());
        self.waker.wake();
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn deadlines(&self) -> Vec<(&'static str, Option<SystemTime>)> {
        self.state.lock().deadlines.clone()
    }

    pub(crate) fn boxed(&self) -> BoxConn {
        Box::new(self.clone())
    }
}

impl Conn for MockConn {
    fn poll_read(
        &self,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.waker.register(cx.waker());
        let mut state = self.state.lock();
        if state.closed {
            return Poll::Ready(Err(closed()));
        }
        let Some(mut chunk) = state.input.pop_front() else {
            return Poll::Pending;
        };
        let n = buf.remaining().min(chunk.len());
        buf.put_slice(&chunk[..n]);
        if n < chunk.len() {
            state.input.push_front(chunk.split_off(n));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_write(&self, _cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock();
        if state.closed {
            return Poll::Ready(Err(closed()));
        }
        state.written.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn close(&self) -> io::Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.closed {
            return Err(closed());
        }
        state.closed = true;
        drop(state);
        self.waker.wake();
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::from(([127, 0, 0, 1], 50000)))
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::from(([127, 0, 0, 2], 443)))
    }

    fn network(&self) -> Network {
        self.network
    }

    fn set_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.state.lock().deadlines.push(("deadline", deadline));
        Ok(())
    }

    fn set_read_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.state.lock().deadlines.push(("read", deadline));
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.state.lock().deadlines.push(("write", deadline));
        Ok(())
    }
}

/// A TLS connection whose handshake already happened, backed by a [`MockConn`].
#[derive(Debug, Clone)]
pub(crate) struct MockTlsConn {
    conn: MockConn,
    alpn: Option<String>,
}

impl MockTlsConn {
    pub(crate) fn new(conn: MockConn, alpn: Option<&str>) -> Self {
        Self {
            conn,
            alpn: alpn.map(str::to_owned),
        }
    }

    pub(crate) fn boxed(&self) -> BoxTlsConn {
        Box::new(self.clone())
    }
}

impl Conn for MockTlsConn {
    fn poll_read(
        &self,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.conn.poll_read(cx, buf)
    }

    fn poll_write(&self, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.conn.poll_write(cx, buf)
    }

    fn close(&self) -> io::Result<()> {
        self.conn.close()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.remote_addr()
    }

    fn network(&self) -> Network {
        self.conn.network()
    }

    fn set_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.conn.set_deadline(deadline)
    }

    fn set_read_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.conn.set_read_deadline(deadline)
    }

    fn set_write_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.conn.set_write_deadline(deadline)
    }
}

impl TlsConn for MockTlsConn {
    fn handshake<'a>(&'a self, _ctx: &'a Context) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn connection_state(&self) -> TlsConnectionState {
        TlsConnectionState {
            handshake_complete: true,
            negotiated_protocol: self.alpn.clone(),
            version: Some("TLS 1.3".to_owned()),
            ..Default::default()
        }
    }

    fn net_conn(&self) -> &dyn Conn {
        &self.conn
    }
}

/// Dialer which either fails or hands out one prepared connection.
#[derive(Debug, Clone)]
pub(crate) struct MockDialer {
    dials: Arc<AtomicUsize>,
    outcome: Result<MockConn, io::ErrorKind>,
}

impl MockDialer {
    pub(crate) fn failing(kind: io::ErrorKind) -> Self {
        Self {
            dials: Arc::default(),
            outcome: Err(kind),
        }
    }

    pub(crate) fn succeeding(conn: MockConn) -> Self {
        Self {
            dials: Arc::default(),
            outcome: Ok(conn),
        }
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl Dialer for MockDialer {
    fn dial<'a>(
        &'a self,
        _ctx: &'a Context,
        _network: Network,
        _address: &'a str,
    ) -> BoxFuture<'a, io::Result<BoxConn>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .outcome
            .clone()
            .map(|conn| conn.boxed())
            .map_err(io::Error::from);
        Box::pin(async move { outcome })
    }
}

/// One captured tracing event.
#[derive(Debug, Clone)]
pub(crate) struct CapturedEvent {
    pub(crate) name: String,
    pub(crate) level: Level,
    pub(crate) fields: HashMap<String, String>,
}

/// Events captured by [`capture_events`].
#[derive(Debug, Clone, Default)]
pub(crate) struct Captured {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl Captured {
    pub(crate) fn all(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }

    /// Names of pipeline events, skipping free-form diagnostics.
    pub(crate) fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|e| e.name.clone())
            .collect()
    }

    pub(crate) fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name == name).count()
    }

    /// The value of `field` on the first event called `name`.
    pub(crate) fn field(&self, name: &str, field: &str) -> Option<String> {
        self.events
            .lock()
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.fields.get(field).cloned())
    }
}

struct CaptureLayer {
    captured: Captured,
}

#[derive(Default)]
struct FieldVisitor {
    name: String,
    fields: HashMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.name = value.to_owned();
        } else {
            self.fields.insert(field.name().to_owned(), value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let value = format!("{value:?}");
        if field.name() == "message" {
            self.name = value;
        } else {
            self.fields.insert(field.name().to_owned(), value);
        }
    }
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.captured.events.lock().push(CapturedEvent {
            name: visitor.name,
            level: *event.metadata().level(),
            fields: visitor.fields,
        });
    }
}

/// Capture events emitted on this thread until the guard is dropped.
pub(crate) fn capture_events() -> (Captured, DefaultGuard) {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::registry()
        .with(CaptureLayer {
            captured: captured.clone(),
        })
        .with(tracing_subscriber::filter::LevelFilter::DEBUG);
    let guard = tracing::subscriber::set_default(subscriber);
    (captured, guard)
}

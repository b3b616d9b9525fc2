//! DNS exchanges over pipeline connections.
//!
//! The wrappers in this module own an established channel and exchange any
//! number of queries over it:
//!
//! | Wrapper | Channel | `serverProtocol` |
//! |---|---|---|
//! | [`DnsOverUdpConn`] | connected UDP socket | `udp` |
//! | [`DnsOverTcpConn`] | TCP stream | `tcp` |
//! | [`DnsOverTlsConn`] | TLS connection | `dot` |
//! | [`DnsOverHttpsConn`] | [`HttpConn`](crate::http::HttpConn) | `doh` |
//!
//! Every exchange is logged as `dnsExchangeStart` / `dnsExchangeDone`, with
//! `dnsQuery` and `dnsResponse` events carrying the raw messages. The wire
//! transports are built with an [`UnusedDialer`]: an exchange only ever uses
//! the owned channel.

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use crate::config::Clock;
use crate::conn::{BoxConn, Conn};
use crate::connect::Dialer;
use crate::context::Context;
use crate::errclass::{classify_opt, ErrClassifier};
use crate::error::Error;
use crate::info::{ConnectionInfo, Network};
use crate::slog::{self, Logger};

mod codec;
mod https;
mod tcp;
mod tls;
pub mod transport;
mod udp;

pub use self::codec::{DnsError, DnsQuery, DnsResponse, DEFAULT_MAX_PAYLOAD, PADDING_BLOCK_SIZE};
pub use self::https::{DnsOverHttpsConn, DnsOverHttpsConnFunc};
pub use self::tcp::{DnsOverTcpConn, DnsOverTcpConnFunc};
pub use self::tls::{DnsOverTlsConn, DnsOverTlsConnFunc};
pub use self::transport::RawObserver;
pub use self::udp::{DnsOverUdpConn, DnsOverUdpConnFunc};

pub use hickory_proto::op::ResponseCode;
pub use hickory_proto::rr::RecordType;

/// Holds the raw query of an exchange so the response event can repeat it.
pub type RawQuerySlot = Arc<Mutex<Vec<u8>>>;

/// Logging shared by every DNS exchange.
///
/// Public so that custom exchange loops, for example one collecting
/// duplicate UDP responses, log exactly like the wrappers do.
#[derive(Debug, Clone)]
pub struct DnsExchangeLogContext {
    /// Classifier for the `errClass` field.
    pub err_classifier: Arc<dyn ErrClassifier>,

    /// The `localAddr` field.
    pub local_addr: String,

    /// Destination of the log events.
    pub logger: Logger,

    /// The `protocol` field: the transport network.
    pub protocol: String,

    /// The `remoteAddr` field.
    pub remote_addr: String,

    /// The `serverProtocol` field: `udp`, `tcp`, `dot` or `doh`.
    pub server_protocol: String,

    /// Clock for event timestamps.
    pub clock: Clock,
}

impl DnsExchangeLogContext {
    /// A context describing exchanges over `conn`.
    pub fn new(
        conn: &dyn Conn,
        server_protocol: impl Into<String>,
        err_classifier: Arc<dyn ErrClassifier>,
        clock: Clock,
        logger: Logger,
    ) -> Self {
        let info = ConnectionInfo::of(conn);
        Self {
            err_classifier,
            local_addr: info.local(),
            logger,
            protocol: info.protocol().to_owned(),
            remote_addr: info.remote(),
            server_protocol: server_protocol.into(),
            clock,
        }
    }

    /// Emit `dnsExchangeStart`.
    pub fn log_start(&self, t0: SystemTime, deadline: Option<SystemTime>) {
        tracing::info!(
            parent: self.logger.span(),
            deadline = %slog::deadline(deadline),
            localAddr = %self.local_addr,
            protocol = %self.protocol,
            remoteAddr = %self.remote_addr,
            serverProtocol = %self.server_protocol,
            t = %slog::timestamp(t0),
            "dnsExchangeStart"
        );
    }

    /// Emit `dnsExchangeDone`.
    pub fn log_done(
        &self,
        t0: SystemTime,
        deadline: Option<SystemTime>,
        err: Option<&(dyn StdError + 'static)>,
    ) {
        tracing::info!(
            parent: self.logger.span(),
            deadline = %slog::deadline(deadline),
            err = %slog::error_message(err),
            errClass = %classify_opt(self.err_classifier.as_ref(), err),
            localAddr = %self.local_addr,
            protocol = %self.protocol,
            remoteAddr = %self.remote_addr,
            serverProtocol = %self.server_protocol,
            t0 = %slog::timestamp(t0),
            t = %slog::timestamp(self.clock.now()),
            "dnsExchangeDone"
        );
    }

    /// An observer emitting `dnsQuery` and remembering the query in `slot`.
    pub fn make_query_observer(&self, t0: SystemTime, slot: &RawQuerySlot) -> RawObserver {
        let lc = self.clone();
        let slot = slot.clone();
        Arc::new(move |raw_query: &[u8]| {
            tracing::info!(
                parent: lc.logger.span(),
                serverProtocol = %lc.server_protocol,
                dnsRawQuery = %slog::bytes(raw_query),
                localAddr = %lc.local_addr,
                protocol = %lc.protocol,
                remoteAddr = %lc.remote_addr,
                t = %slog::timestamp(t0),
                "dnsQuery"
            );
            *slot.lock() = raw_query.to_vec();
        })
    }

    /// An observer emitting `dnsResponse` along with the query from `slot`.
    pub fn make_response_observer(&self, t0: SystemTime, slot: &RawQuerySlot) -> RawObserver {
        let lc = self.clone();
        let slot = slot.clone();
        Arc::new(move |raw_response: &[u8]| {
            let raw_query = slot.lock().clone();
            tracing::info!(
                parent: lc.logger.span(),
                serverProtocol = %lc.server_protocol,
                dnsRawQuery = %slog::bytes(&raw_query),
                localAddr = %lc.local_addr,
                protocol = %lc.protocol,
                remoteAddr = %lc.remote_addr,
                t0 = %slog::timestamp(t0),
                t = %slog::timestamp(lc.clock.now()),
                dnsRawResponse = %slog::bytes(raw_response),
                "dnsResponse"
            );
        })
    }

    /// Observers for one exchange, correlated through a fresh slot.
    pub(crate) fn observers(&self, t0: SystemTime) -> transport::Observers {
        let slot = RawQuerySlot::default();
        transport::Observers {
            raw_query: Some(self.make_query_observer(t0, &slot)),
            raw_response: Some(self.make_response_observer(t0, &slot)),
        }
    }
}

/// Dialer handed to wire transports owned by the wrappers.
///
/// # Panics
///
/// Every call to [`dial`](Dialer::dial) panics: a wrapper's transport must
/// exchange over the channel it was given and never open a connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnusedDialer;

impl Dialer for UnusedDialer {
    fn dial<'a>(
        &'a self,
        _ctx: &'a Context,
        _network: Network,
        _address: &'a str,
    ) -> BoxFuture<'a, io::Result<BoxConn>> {
        panic!("netops: DNS transport must not dial; this is a programming error")
    }
}

/// The endpoint given to wrapper transports, which never dial it.
pub(crate) fn unused_endpoint() -> std::net::SocketAddr {
    std::net::SocketAddr::from(([0, 0, 0, 0], 0))
}

/// Log the start of an exchange, run it, and log its outcome.
pub(crate) async fn logged_exchange<F, Fut>(
    lc: &DnsExchangeLogContext,
    ctx: &Context,
    exchange: F,
) -> Result<DnsResponse, Error>
where
    F: FnOnce(transport::Observers) -> Fut,
    Fut: std::future::Future<Output = Result<DnsResponse, Error>>,
{
    let t0 = lc.clock.now();
    let deadline = ctx.deadline();
    let observers = lc.observers(t0);

    lc.log_start(t0, deadline);
    let result = exchange(observers).await;
    lc.log_done(
        t0,
        deadline,
        result
            .as_ref()
            .err()
            .map(|err| err as &(dyn StdError + 'static)),
    );
    result
}

use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::transport::DnsOverStreamTransport;
use super::{logged_exchange, unused_endpoint, DnsExchangeLogContext, DnsQuery, DnsResponse, UnusedDialer};
use crate::config::{Clock, Config};
use crate::conn::{BoxConn, Conn};
use crate::context::Context;
use crate::errclass::ErrClassifier;
use crate::error::Error;
use crate::func::Func;
use crate::slog::Logger;

/// A TCP stream used for DNS exchanges.
///
/// Exchanges must not run concurrently: each one writes a frame and then reads
/// the next frame off the stream.
#[derive(Debug)]
pub struct DnsOverTcpConn {
    conn: BoxConn,

    /// Classifier for the `errClass` field.
    pub err_classifier: Arc<dyn ErrClassifier>,

    /// Clock for event timestamps.
    pub clock: Clock,

    /// Destination of the log events.
    pub logger: Logger,
}

impl DnsOverTcpConn {
    /// Send `query` and read the response.
    pub async fn exchange(&self, ctx: &Context, query: &DnsQuery) -> Result<DnsResponse, Error> {
        let conn = self.conn.as_ref();
        let lc = DnsExchangeLogContext::new(
            conn,
            "tcp",
            self.err_classifier.clone(),
            self.clock.clone(),
            self.logger.clone(),
        );

        logged_exchange(&lc, ctx, |observers| async move {
            let mut txp = DnsOverStreamTransport::new(Arc::new(UnusedDialer), unused_endpoint());
            txp.observers = observers;
            txp.exchange_with_conn(ctx, conn, query).await
        })
        .await
    }

    /// The stream, for metadata.
    pub fn conn(&self) -> &dyn Conn {
        self.conn.as_ref()
    }

    /// Close the stream.
    pub fn close(&self) -> Result<(), Error> {
        Ok(self.conn.close()?)
    }
}

/// Wraps a TCP connection into a [`DnsOverTcpConn`].
#[derive(Debug, Clone)]
pub struct DnsOverTcpConnFunc {
    /// Classifier for the `errClass` field.
    pub err_classifier: Arc<dyn ErrClassifier>,

    /// Clock for event timestamps.
    pub clock: Clock,

    /// Destination of the log events.
    pub logger: Logger,
}

impl DnsOverTcpConnFunc {
    /// Build a DNS-over-TCP stage.
    pub fn new(config: &Config, logger: Logger) -> Self {
        Self {
            err_classifier: config.err_classifier.clone(),
            clock: config.clock.clone(),
            logger,
        }
    }
}

impl Func<BoxConn> for DnsOverTcpConnFunc {
    type Output = DnsOverTcpConn;

    fn call<'a>(&'a self, _ctx: &'a Context, conn: BoxConn) -> BoxFuture<'a, Result<DnsOverTcpConn, Error>> {
        let conn = DnsOverTcpConn {
            conn,
            err_classifier: self.err_classifier.clone(),
            clock: self.clock.clone(),
            logger: self.logger.clone(),
        };
        Box::pin(async move { Ok(conn) })
    }
}

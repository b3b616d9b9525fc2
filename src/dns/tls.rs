use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::transport::DnsOverStreamTransport;
use super::{logged_exchange, unused_endpoint, DnsExchangeLogContext, DnsQuery, DnsResponse, UnusedDialer};
use crate::config::{Clock, Config};
use crate::conn::Conn;
use crate::context::Context;
use crate::errclass::ErrClassifier;
use crate::error::Error;
use crate::func::Func;
use crate::slog::Logger;
use crate::tls::{BoxTlsConn, TlsConn};

/// A TLS connection used for DNS exchanges (RFC 7858).
///
/// Queries are padded to 128-byte blocks and set the DNSSEC OK bit.
#[derive(Debug)]
pub struct DnsOverTlsConn {
    conn: BoxTlsConn,

    /// Classifier for the `errClass` field.
    pub err_classifier: Arc<dyn ErrClassifier>,

    /// Clock for event timestamps.
    pub clock: Clock,

    /// Destination of the log events.
    pub logger: Logger,
}

impl DnsOverTlsConn {
    /// Send `query` and read the response.
    pub async fn exchange(&self, ctx: &Context, query: &DnsQuery) -> Result<DnsResponse, Error> {
        let conn: &dyn Conn = &self.conn;
        let lc = DnsExchangeLogContext::new(
            conn,
            "dot",
            self.err_classifier.clone(),
            self.clock.clone(),
            self.logger.clone(),
        );

        logged_exchange(&lc, ctx, |observers| async move {
            let mut txp =
                DnsOverStreamTransport::new(Arc::new(UnusedDialer), unused_endpoint()).with_tls();
            txp.observers = observers;
            txp.exchange_with_conn(ctx, conn, query).await
        })
        .await
    }

    /// The TLS connection, for metadata.
    pub fn conn(&self) -> &dyn TlsConn {
        self.conn.as_ref()
    }

    /// Close the TLS connection and the connection beneath it.
    pub fn close(&self) -> Result<(), Error> {
        Ok(self.conn.close()?)
    }
}

/// Wraps a TLS connection into a [`DnsOverTlsConn`].
#[derive(Debug, Clone)]
pub struct DnsOverTlsConnFunc {
    /// Classifier for the `errClass` field.
    pub err_classifier: Arc<dyn ErrClassifier>,

    /// Clock for event timestamps.
    pub clock: Clock,

    /// Destination of the log events.
    pub logger: Logger,
}

impl DnsOverTlsConnFunc {
    /// Build a DNS-over-TLS stage.
    pub fn new(config: &Config, logger: Logger) -> Self {
        Self {
            err_classifier: config.err_classifier.clone(),
            clock: config.clock.clone(),
            logger,
        }
    }
}

impl Func<BoxTlsConn> for DnsOverTlsConnFunc {
    type Output = DnsOverTlsConn;

    fn call<'a>(&'a self, _ctx: &'a Context, conn: BoxTlsConn) -> BoxFuture<'a, Result<DnsOverTlsConn, Error>> {
        let conn = DnsOverTlsConn {
            conn,
            err_classifier: self.err_classifier.clone(),
            clock: self.clock.clone(),
            logger: self.logger.clone(),
        };
        Box::pin(async move { Ok(conn) })
    }
}

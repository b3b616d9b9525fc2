use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::transport::DnsOverUdpTransport;
use super::{logged_exchange, unused_endpoint, DnsExchangeLogContext, DnsQuery, DnsResponse, UnusedDialer};
use crate::config::{Clock, Config};
use crate::conn::{BoxConn, Conn};
use crate::context::Context;
use crate::errclass::ErrClassifier;
use crate::error::Error;
use crate::func::Func;
use crate::slog::Logger;

/// A connected UDP socket used for DNS exchanges.
///
/// The caller is responsible for calling [`close`](DnsOverUdpConn::close).
#[derive(Debug)]
pub struct DnsOverUdpConn {
    conn: BoxConn,

    /// Classifier for the `errClass` field.
    pub err_classifier: Arc<dyn ErrClassifier>,

    /// Clock for event timestamps.
    pub clock: Clock,

    /// Destination of the log events.
    pub logger: Logger,
}

impl DnsOverUdpConn {
    /// Send `query` and wait for the matching response.
    pub async fn exchange(&self, ctx: &Context, query: &DnsQuery) -> Result<DnsResponse, Error> {
        let conn = self.conn.as_ref();
        let lc = DnsExchangeLogContext::new(
            conn,
            "udp",
            self.err_classifier.clone(),
            self.clock.clone(),
            self.logger.clone(),
        );

        logged_exchange(&lc, ctx, |observers| async move {
            let mut txp = DnsOverUdpTransport::new(Arc::new(UnusedDialer), unused_endpoint());
            txp.observers = observers;
            txp.exchange_with_conn(ctx, conn, query).await
        })
        .await
    }

    /// The socket, for metadata.
    pub fn conn(&self) -> &dyn Conn {
        self.conn.as_ref()
    }

    /// Close the socket.
    pub fn close(&self) -> Result<(), Error> {
        Ok(self.conn.close()?)
    }
}

/// Wraps a UDP connection into a [`DnsOverUdpConn`].
#[derive(Debug, Clone)]
pub struct DnsOverUdpConnFunc {
    /// Classifier for the `errClass` field.
    pub err_classifier: Arc<dyn ErrClassifier>,

    /// Clock for event timestamps.
    pub clock: Clock,

    /// Destination of the log events.
    pub logger: Logger,
}

impl DnsOverUdpConnFunc {
    /// Build a DNS-over-UDP stage.
    pub fn new(config: &Config, logger: Logger) -> Self {
        Self {
            err_classifier: config.err_classifier.clone(),
            clock: config.clock.clone(),
            logger,
        }
    }
}

impl Func<BoxConn> for DnsOverUdpConnFunc {
    type Output = DnsOverUdpConn;

    fn call<'a>(&'a self, _ctx: &'a Context, conn: BoxConn) -> BoxFuture<'a, Result<DnsOverUdpConn, Error>> {
        let conn = DnsOverUdpConn {
            conn,
            err_classifier: self.err_classifier.clone(),
            clock: self.clock.clone(),
            logger: self.logger.clone(),
        };
        Box::pin(async move { Ok(conn) })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::dns::codec::testing::answer;
    use crate::dns::{DnsError, RecordType, ResponseCode};
    use crate::error::is_closed;
    use crate::fixtures::{capture_events, MockConn};
    use crate::info::Network;

    #[tokio::test]
    async fn exchange_is_logged() {
        let (events, _guard) = capture_events();
        let mock = MockConn::new(Network::Udp);
        let conn = DnsOverUdpConnFunc::new(&Config::new(), Logger::current())
            .call(&Context::background(), mock.boxed())
            .await
            .unwrap();

        let ctx = Context::background();
        let query = DnsQuery::new("dns.google", RecordType::A);
        let exchange = conn.exchange(&ctx, &query);
        let responder = async {
            tokio::task::yield_now().await;
            mock.feed(&answer(&mock.written(), ResponseCode::NoError, &[Ipv4Addr::new(8, 8, 8, 8)]));
        };
        let (response, ()) = tokio::join!(exchange, responder);
        assert_eq!(response.unwrap().records_a().unwrap(), [Ipv4Addr::new(8, 8, 8, 8)]);

        assert_eq!(
            events.names(),
            ["dnsExchangeStart", "dnsQuery", "dnsResponse", "dnsExchangeDone"]
        );
        assert_eq!(events.field("dnsExchangeDone", "serverProtocol"), Some("udp".to_owned()));
        assert_eq!(events.field("dnsExchangeDone", "err"), Some(String::new()));
    }

    #[tokio::test]
    async fn failures_are_logged_and_returned() {
        let (events, _guard) = capture_events();
        let mock = MockConn::new(Network::Udp);
        let conn = DnsOverUdpConnFunc::new(&Config::new(), Logger::current())
            .call(&Context::background(), mock.boxed())
            .await
            .unwrap();

        let ctx = Context::background();
        let query = DnsQuery::new("nx.example", RecordType::A);
        let exchange = conn.exchange(&ctx, &query);
        let responder = async {
            tokio::task::yield_now().await;
            mock.feed(&answer(&mock.written(), ResponseCode::NXDomain, &[]));
        };
        let (response, ()) = tokio::join!(exchange, responder);

        assert!(matches!(response, Err(Error::Dns(DnsError::NoName))));
        assert_eq!(events.field("dnsExchangeDone", "err"), Some("dns: no such host".to_owned()));

        conn.close().unwrap();
        assert!(matches!(conn.close(), Err(Error::Io(ref err)) if is_closed(err)));
    }
}

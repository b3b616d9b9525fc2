use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::transport::{new_request, read_response};
use super::{logged_exchange, DnsExchangeLogContext, DnsQuery, DnsResponse};
use crate::config::{Clock, Config};
use crate::context::Context;
use crate::errclass::ErrClassifier;
use crate::error::Error;
use crate::func::Func;
use crate::http::HttpConn;
use crate::slog::Logger;

/// An HTTP connection used for DNS exchanges (RFC 8484).
///
/// Over HTTP/1.1 the underlying [`HttpConn`] carries a single round trip, so
/// only the first exchange can succeed. Over HTTP/2 exchanges may run
/// concurrently.
#[derive(Debug)]
pub struct DnsOverHttpsConn {
    conn: HttpConn,

    /// URL queries are posted to, e.g. `https://dns.google/dns-query`.
    pub url: String,

    /// Classifier for the `errClass` field.
    pub err_classifier: Arc<dyn ErrClassifier>,

    /// Clock for event timestamps.
    pub clock: Clock,

    /// Destination of the log events.
    pub logger: Logger,
}

impl DnsOverHttpsConn {
    /// Post `query` to the server and read the response.
    pub async fn exchange(&self, ctx: &Context, query: &DnsQuery) -> Result<DnsResponse, Error> {
        let lc = DnsExchangeLogContext::new(
            self.conn.conn(),
            "doh",
            self.err_classifier.clone(),
            self.clock.clone(),
            self.logger.clone(),
        );

        logged_exchange(&lc, ctx, |observers| async move {
            let (request, message) = new_request(&self.url, query, observers.raw_query.as_ref())?;
            let response = self.conn.round_trip(ctx, request).await?;
            read_response(response, &message, observers.raw_response.as_ref()).await
        })
        .await
    }

    /// The HTTP transport.
    pub fn http_conn(&self) -> &HttpConn {
        &self.conn
    }

    /// Close the HTTP transport and its connection.
    pub fn close(&self) -> Result<(), Error> {
        self.conn.close()
    }
}

/// Wraps an [`HttpConn`] into a [`DnsOverHttpsConn`] posting to `url`.
#[derive(Debug, Clone)]
pub struct DnsOverHttpsConnFunc {
    /// URL queries are posted to.
    pub url: String,

    /// Classifier for the `errClass` field.
    pub err_classifier: Arc<dyn ErrClassifier>,

    /// Clock for event timestamps.
    pub clock: Clock,

    /// Destination of the log events.
    pub logger: Logger,
}

impl DnsOverHttpsConnFunc {
    /// Build a DNS-over-HTTPS stage for `url`.
    pub fn new(config: &Config, url: impl Into<String>, logger: Logger) -> Self {
        Self {
            url: url.into(),
            err_classifier: config.err_classifier.clone(),
            clock: config.clock.clone(),
            logger,
        }
    }
}

impl Func<HttpConn> for DnsOverHttpsConnFunc {
    type Output = DnsOverHttpsConn;

    fn call<'a>(&'a self, _ctx: &'a Context, conn: HttpConn) -> BoxFuture<'a, Result<DnsOverHttpsConn, Error>> {
        let conn = DnsOverHttpsConn {
            conn,
            url: self.url.clone(),
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
    use crate::fixtures::{capture_events, MockConn};
    use crate::http::HttpConnFunc;

    /// The request body, once the whole request has been written.
    fn request_body(written: &[u8]) -> Option<Vec<u8>> {
        let end = written.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
        let head = String::from_utf8_lossy(&written[..end]).to_ascii_lowercase();
        let length: usize = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))?
            .trim()
            .parse()
            .ok()?;
        (written.len() >= end + length).then(|| written[end..end + length].to_vec())
    }

    async fn doh_conn(mock: &MockConn, url: &str) -> DnsOverHttpsConn {
        let config = Config::new();
        let http = HttpConnFunc::plain(&config, Logger::current())
            .call(&Context::background(), mock.boxed())
            .await
            .unwrap();
        DnsOverHttpsConnFunc::new(&config, url, Logger::current())
            .call(&Context::background(), http)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn exchange_over_http1() {
        let (events, _guard) = capture_events();
        let mock = MockConn::tcp();
        let conn = doh_conn(&mock, "http://dns.example/dns-query").await;

        let ctx = Context::background();
        let query = DnsQuery::new("dns.google", RecordType::A);
        let exchange = conn.exchange(&ctx, &query);
        let responder = async {
            let raw_query = loop {
                tokio::task::yield_now().await;
                if let Some(body) = request_body(&mock.written()) {
                    break body;
                }
            };
            let body = answer(&raw_query, ResponseCode::NoError, &[Ipv4Addr::new(8, 8, 4, 4)]);
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/dns-message\r\ncontent-length: {}\r\n\r\n",
                body.len()
            );
            mock.feed(head.as_bytes());
            mock.feed(&body);
        };
        let (response, ()) = tokio::join!(exchange, responder);
        assert_eq!(response.unwrap().records_a().unwrap(), [Ipv4Addr::new(8, 8, 4, 4)]);

        let request = String::from_utf8_lossy(&mock.written()).to_string();
        assert!(request.starts_with("POST /dns-query HTTP/1.1\r\n"));

        assert_eq!(
            events.names(),
            [
                "dnsExchangeStart",
                "dnsQuery",
                "httpRoundTripStart",
                "httpRoundTripDone",
                "httpBodyStreamStart",
                "httpBodyStreamDone",
                "dnsResponse",
                "dnsExchangeDone",
            ]
        );
        assert_eq!(events.field("dnsExchangeDone", "serverProtocol"), Some("doh".to_owned()));
        assert_eq!(events.field("dnsExchangeDone", "err"), Some(String::new()));
    }

    #[tokio::test]
    async fn bad_urls_are_logged() {
        let (events, _guard) = capture_events();
        let mock = MockConn::tcp();
        let conn = doh_conn(&mock, "not a url").await;

        let err = conn
            .exchange(&Context::background(), &DnsQuery::new("dns.google", RecordType::A))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dns(DnsError::Url(_))));
        assert_eq!(events.names(), ["dnsExchangeStart", "dnsExchangeDone"]);
        assert!(!conn.http_conn().dialer().is_used());

        conn.close().unwrap();
        assert!(mock.is_closed());
    }
}

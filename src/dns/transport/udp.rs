use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType};
use hickory_proto::serialize::binary::BinDecodable as _;

use super::{DeadlineGuard, Observers};
use crate::conn::{Conn, ConnExt as _};
use crate::connect::Dialer;
use crate::context::Context;
use crate::dns::{DnsError, DnsQuery, DnsResponse};
use crate::error::Error;
use crate::info::Network;

/// Largest datagram we are prepared to receive.
const MAX_DATAGRAM_SIZE: usize = 65535;

/// DNS over UDP (RFC 1035).
///
/// Queries carry a random id. Datagrams which are not a response to that id
/// are ignored, so a spoofed or late answer does not end the exchange.
#[derive(Debug, Clone)]
pub struct DnsOverUdpTransport {
    /// Opens connections for [`exchange`](Self::exchange).
    pub dialer: Arc<dyn Dialer>,

    /// Server address used when dialing.
    pub endpoint: SocketAddr,

    /// Raw message observers.
    pub observers: Observers,
}

impl DnsOverUdpTransport {
    /// A transport sending queries to `endpoint`.
    pub fn new(dialer: Arc<dyn Dialer>, endpoint: SocketAddr) -> Self {
        Self {
            dialer,
            endpoint,
            observers: Observers::default(),
        }
    }

    /// Dial the endpoint, exchange `query`, and close the connection.
    pub async fn exchange(&self, ctx: &Context, query: &DnsQuery) -> Result<DnsResponse, Error> {
        let conn = self
            .dialer
            .dial(ctx, Network::Udp, &self.endpoint.to_string())
            .await?;
        let result = self.exchange_with_conn(ctx, conn.as_ref(), query).await;
        let _ = conn.close();
        result
    }

    /// Exchange `query` over an already connected datagram socket.
    pub async fn exchange_with_conn(
        &self,
        ctx: &Context,
        conn: &dyn Conn,
        query: &DnsQuery,
    ) -> Result<DnsResponse, Error> {
        let (message, raw_query) = query.encode(rand::random())?;
        let _deadline = DeadlineGuard::set(conn, ctx.deadline())?;

        self.observers.query(&raw_query);
        conn.write(&raw_query).await?;

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let n = conn.read(&mut buf).await?;
            let raw_response = &buf[..n];
            self.observers.response(raw_response);

            let response = Message::from_bytes(raw_response).map_err(DnsError::from)?;
            if response.message_type() != MessageType::Response || response.id() != message.id() {
                tracing::trace!(id = response.id(), "ignoring unrelated datagram");
                continue;
            }
            return Ok(DnsResponse::from_message(
                &message,
                response,
                raw_response.to_vec(),
            )?);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::RecordType;
    use hickory_proto::serialize::binary::BinEncodable as _;
    use parking_lot::Mutex;

    use super::*;
    use crate::dns::codec::testing::answer;
    use crate::fixtures::{MockConn, MockDialer};
    use crate::info::Network;

    fn transport(dialer: MockDialer) -> DnsOverUdpTransport {
        DnsOverUdpTransport::new(Arc::new(dialer), SocketAddr::from(([127, 0, 0, 2], 53)))
    }

    #[tokio::test]
    async fn skips_responses_with_other_ids() {
        let mock = MockConn::new(Network::Udp);
        let txp = transport(MockDialer::failing(std::io::ErrorKind::Other));
        let addrs = [Ipv4Addr::new(8, 8, 8, 8)];

        let ctx = Context::background();
        let query = DnsQuery::new("dns.google", RecordType::A);
        let exchange = txp.exchange_with_conn(&ctx, &mock, &query);
        let responder = async {
            tokio::task::yield_now().await;
            let raw_query = mock.written();

            let mut spoofed = Message::from_bytes(&answer(&raw_query, ResponseCode::NoError, &[]))
                .unwrap();
            spoofed.set_id(spoofed.id().wrapping_add(1));
            mock.feed(&spoofed.to_bytes().unwrap());
            tokio::task::yield_now().await;
            mock.feed(&answer(&raw_query, ResponseCode::NoError, &addrs));
        };

        let (response, ()) = tokio::join!(exchange, responder);
        assert_eq!(response.unwrap().records_a().unwrap(), addrs);
    }

    #[tokio::test]
    async fn observers_see_raw_messages() {
        let mock = MockConn::new(Network::Udp);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut txp = transport(MockDialer::succeeding(mock.clone()));
        txp.observers.raw_query = Some(Arc::new({
            let seen = seen.clone();
            move |raw: &[u8]| seen.lock().push(("query", raw.to_vec()))
        }));
        txp.observers.raw_response = Some(Arc::new({
            let seen = seen.clone();
            move |raw: &[u8]| seen.lock().push(("response", raw.to_vec()))
        }));

        let ctx = Context::background();
        let query = DnsQuery::new("dns.google", RecordType::A);
        let exchange = txp.exchange(&ctx, &query);
        let responder = async {
            tokio::task::yield_now().await;
            mock.feed(&answer(&mock.written(), ResponseCode::NXDomain, &[]));
        };
        let (result, ()) = tokio::join!(exchange, responder);

        assert!(matches!(result, Err(Error::Dns(DnsError::NoName))));
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, mock.written());
        assert_eq!(seen[1].0, "response");
        assert!(mock.is_closed());
    }

    #[tokio::test]
    async fn context_deadline_is_applied_and_cleared() {
        let mock = MockConn::new(Network::Udp);
        let txp = transport(MockDialer::failing(std::io::ErrorKind::Other));
        let (ctx, _cancel) = Context::background().with_timeout(std::time::Duration::from_secs(5));

        let query = DnsQuery::new("dns.google", RecordType::A);
        let exchange = txp.exchange_with_conn(&ctx, &mock, &query);
        let responder = async {
            tokio::task::yield_now().await;
            mock.feed(&answer(&mock.written(), ResponseCode::NoError, &[Ipv4Addr::LOCALHOST]));
        };
        let (result, ()) = tokio::join!(exchange, responder);
        assert!(result.is_ok());

        let deadlines = mock.deadlines();
        assert_eq!(deadlines.len(), 2);
        assert_eq!(deadlines[0], ("deadline", ctx.deadline()));
        assert_eq!(deadlines[1], ("deadline", None));
    }
}

use std::net::SocketAddr;
use std::sync::Arc;

use super::{DeadlineGuard, Observers};
use crate::conn::{Conn, ConnExt as _};
use crate::connect::Dialer;
use crate::context::Context;
use crate::dns::{DnsError, DnsQuery, DnsResponse};
use crate::error::Error;
use crate::info::Network;

/// DNS over a byte stream: TCP (RFC 7766) or TLS (RFC 7858).
///
/// Every message is preceded by its length as a big-endian `u16`. Over TLS,
/// queries also enable EDNS(0) block padding (RFC 8467) and the DNSSEC OK bit.
#[derive(Debug, Clone)]
pub struct DnsOverStreamTransport {
    /// Opens TCP connections for [`exchange`](Self::exchange).
    pub dialer: Arc<dyn Dialer>,

    /// Server address used when dialing.
    pub endpoint: SocketAddr,

    /// Pad queries and request DNSSEC records, as done over TLS.
    pub tls: bool,

    /// Raw message observers.
    pub observers: Observers,
}

impl DnsOverStreamTransport {
    /// A transport sending queries to `endpoint` over TCP.
    pub fn new(dialer: Arc<dyn Dialer>, endpoint: SocketAddr) -> Self {
        Self {
            dialer,
            endpoint,
            tls: false,
            observers: Observers::default(),
        }
    }

    /// Shape queries for an encrypted stream.
    pub fn with_tls(mut self) -> Self {
        self.tls = true;
        self
    }

    /// Dial the endpoint over TCP, exchange `query`, and close the connection.
    pub async fn exchange(&self, ctx: &Context, query: &DnsQuery) -> Result<DnsResponse, Error> {
        let conn = self
            .dialer
            .dial(ctx, Network::Tcp, &self.endpoint.to_string())
            .await?;
        let result = self.exchange_with_conn(ctx, conn.as_ref(), query).await;
        let _ = conn.close();
        result
    }

    /// Exchange `query` over an established stream.
    pub async fn exchange_with_conn(
        &self,
        ctx: &Context,
        conn: &dyn Conn,
        query: &DnsQuery,
    ) -> Result<DnsResponse, Error> {
        let query = if self.tls {
            query.clone().with_padding().with_dnssec_ok()
        } else {
            query.clone()
        };
        let (message, raw_query) = query.encode(rand::random())?;
        let length = u16::try_from(raw_query.len()).map_err(|_| DnsError::QueryTooLarge)?;

        let _deadline = DeadlineGuard::set(conn, ctx.deadline())?;

        let mut frame = Vec::with_capacity(raw_query.len() + 2);
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(&raw_query);
        self.observers.query(&raw_query);
        conn.write_all(&frame).await?;

        let mut length = [0u8; 2];
        conn.read_exact(&mut length).await?;
        let mut raw_response = vec![0u8; usize::from(u16::from_be_bytes(length))];
        conn.read_exact(&mut raw_response).await?;
        self.observers.response(&raw_response);

        Ok(DnsResponse::parse(&message, &raw_response)?)
    }
}

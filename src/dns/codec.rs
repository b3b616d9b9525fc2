//! DNS messages on top of [`hickory_proto`].

use std::net::{Ipv4Addr, Ipv6Addr};

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable as _, BinEncodable as _};
use hickory_proto::ProtoError;
use thiserror::Error;

/// Queries are padded to a multiple of this many bytes (RFC 8467).
pub const PADDING_BLOCK_SIZE: usize = 128;

/// EDNS(0) payload size advertised when a query enables EDNS without
/// choosing one.
pub const DEFAULT_MAX_PAYLOAD: u16 = 1232;

/// Errors building, decoding or validating DNS messages.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DnsError {
    /// The message could not be encoded or decoded.
    #[error("dns message: {0}")]
    Proto(#[from] ProtoError),

    /// The name does not exist (`NXDOMAIN`).
    #[error("no such host")]
    NoName,

    /// The server failed to answer (`SERVFAIL`).
    #[error("server failure")]
    ServerFailure,

    /// The server refused to answer (`REFUSED`).
    #[error("query refused")]
    Refused,

    /// The response has no records of the requested type.
    #[error("no answer for the requested record type")]
    NoData,

    /// Any other non-success response code.
    #[error("unexpected response code: {0}")]
    ResponseCode(ResponseCode),

    /// The response does not answer the query.
    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),

    /// The query does not fit in a length-prefixed frame.
    #[error("query too large")]
    QueryTooLarge,

    /// The response body exceeded the size limit.
    #[error("response too large")]
    ResponseTooLarge,

    /// The DNS-over-HTTPS server did not answer `200 OK`.
    #[error("http status {0}")]
    HttpStatus(http::StatusCode),

    /// The DNS-over-HTTPS response has the wrong media type.
    #[error("unexpected content type {0:?}")]
    ContentType(String),

    /// The DNS-over-HTTPS URL is invalid.
    #[error("invalid url: {0}")]
    Url(#[from] http::uri::InvalidUri),
}

/// A DNS question plus the options to send it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    /// Domain name to resolve. A trailing dot is optional.
    pub name: String,

    /// Record type to ask for.
    pub record_type: RecordType,

    /// EDNS(0) payload size; `None` sends no OPT record unless another
    /// option needs one.
    pub max_payload: Option<u16>,

    /// Set the DNSSEC OK bit.
    pub dnssec_ok: bool,

    /// Pad the query to [`PADDING_BLOCK_SIZE`].
    pub padding: bool,
}

impl DnsQuery {
    /// A recursive query for `name` and `record_type`, without EDNS.
    pub fn new(name: impl Into<String>, record_type: RecordType) -> Self {
        Self {
            name: name.into(),
            record_type,
            max_payload: None,
            dnssec_ok: false,
            padding: false,
        }
    }

    /// Advertise `max_payload` with EDNS(0).
    pub fn with_max_payload(mut self, max_payload: u16) -> Self {
        self.max_payload = Some(max_payload);
        self
    }

    /// Set the DNSSEC OK bit.
    pub fn with_dnssec_ok(mut self) -> Self {
        self.dnssec_ok = true;
        self
    }

    /// Pad the query for transmission over an encrypted channel.
    pub fn with_padding(mut self) -> Self {
        self.padding = true;
        self
    }

    fn edns(&self) -> Option<Edns> {
        if self.max_payload.is_none() && !self.dnssec_ok && !self.padding {
            return None;
        }
        let mut edns = Edns::new();
        edns.set_version(0);
        edns.set_max_payload(self.max_payload.unwrap_or(DEFAULT_MAX_PAYLOAD));
        edns.set_dnssec_ok(self.dnssec_ok);
        Some(edns)
    }

    /// Build the query message with the given id.
    pub fn to_message(&self, id: u16) -> Result<Message, DnsError> {
        let name = if self.name.ends_with('.') {
            Name::from_ascii(&self.name)?
        } else {
            Name::from_ascii(format!("{}.", self.name))?
        };

        let mut query = Query::query(name, self.record_type);
        query.set_query_class(DNSClass::IN);

        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(query);
        if let Some(edns) = self.edns() {
            message.set_edns(edns);
        }
        Ok(message)
    }

    /// Build and serialize the query, padding it when asked to.
    pub fn encode(&self, id: u16) -> Result<(Message, Vec<u8>), DnsError> {
        let mut message = self.to_message(id)?;

        if self.padding {
            // The padding option adds a four byte header before its payload.
            let unpadded = message.to_bytes()?.len() + 4;
            let pad = (PADDING_BLOCK_SIZE - unpadded % PADDING_BLOCK_SIZE) % PADDING_BLOCK_SIZE;
            if let Some(mut edns) = self.edns() {
                edns.options_mut().insert(EdnsOption::Unknown(
                    u16::from(EdnsCode::Padding),
                    vec![0; pad],
                ));
                message.set_edns(edns);
            }
        }

        let raw = message.to_bytes()?;
        Ok((message, raw))
    }
}

/// A response validated against the query which produced it.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    query: Message,
    message: Message,
    raw: Vec<u8>,
}

impl DnsResponse {
    /// Decode `raw` and check that it answers `query`.
    ///
    /// `NXDOMAIN`, `SERVFAIL`, `REFUSED` and other failure codes are reported
    /// as errors.
    pub fn parse(query: &Message, raw: &[u8]) -> Result<Self, DnsError> {
        let message = Message::from_bytes(raw)?;
        Self::from_message(query, message, raw.to_vec())
    }

    pub(crate) fn from_message(
        query: &Message,
        message: Message,
        raw: Vec<u8>,
    ) -> Result<Self, DnsError> {
        if message.message_type() != MessageType::Response {
            return Err(DnsError::InvalidResponse("message is not a response"));
        }
        if message.id() != query.id() {
            return Err(DnsError::InvalidResponse("id mismatch"));
        }
        if message.queries().len() != 1 || message.queries().first() != query.queries().first() {
            return Err(DnsError::InvalidResponse("question mismatch"));
        }

        match message.response_code() {
            ResponseCode::NoError => {}
            ResponseCode::NXDomain => return Err(DnsError::NoName),
            ResponseCode::ServFail => return Err(DnsError::ServerFailure),
            ResponseCode::Refused => return Err(DnsError::Refused),
            code => return Err(DnsError::ResponseCode(code)),
        }

        Ok(Self {
            query: query.clone(),
            message,
            raw,
        })
    }

    /// The query this response answers.
    pub fn query(&self) -> &Message {
        &self.query
    }

    /// The decoded response.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The response as received.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The response code.
    pub fn rcode(&self) -> ResponseCode {
        self.message.response_code()
    }

    /// IPv4 addresses in the answer section.
    pub fn records_a(&self) -> Result<Vec<Ipv4Addr>, DnsError> {
        let addrs: Vec<_> = self
            .message
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                RData::A(a) => Some(a.0),
                _ => None,
            })
            .collect();
        if addrs.is_empty() {
            return Err(DnsError::NoData);
        }
        Ok(addrs)
    }

    /// IPv6 addresses in the answer section.
    pub fn records_aaaa(&self) -> Result<Vec<Ipv6Addr>, DnsError> {
        let addrs: Vec<_> = self
            .message
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                RData::AAAA(aaaa) => Some(aaaa.0),
                _ => None,
            })
            .collect();
        if addrs.is_empty() {
            return Err(DnsError::NoData);
        }
        Ok(addrs)
    }
}

//! DNS over HTTPS (RFC 8484), `POST` flavour.

use bytes::Bytes;
use hickory_proto::op::Message;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt as _, LengthLimitError, Limited};

use super::RawObserver;
use crate::body::Body;
use crate::dns::{DnsError, DnsQuery, DnsResponse};
use crate::error::{BoxError, Error};

/// Media type of DNS wire-format messages.
pub const DNS_MESSAGE: &str = "application/dns-message";

/// Largest response body accepted.
pub const MAX_RESPONSE_SIZE: usize = 65535;

/// Build the HTTP request carrying `query` to `url`.
///
/// The query id is zero, as recommended for HTTP caching. Returns the request
/// and the query message needed to validate the response.
pub fn new_request(
    url: &str,
    query: &DnsQuery,
    observe: Option<&RawObserver>,
) -> Result<(Request<Body>, Message), Error> {
    let uri: Uri = url.parse().map_err(DnsError::from)?;
    let (message, raw_query) = query.encode(0)?;
    if let Some(observe) = observe {
        observe(&raw_query);
    }

    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, DNS_MESSAGE)
        .header(ACCEPT, DNS_MESSAGE)
        .body(Body::from(raw_query))?;
    Ok((request, message))
}

/// Read and validate the DNS response carried by `response`.
pub async fn read_response<B>(
    response: Response<B>,
    query: &Message,
    observe: Option<&RawObserver>,
) -> Result<DnsResponse, Error>
where
    B: http_body::Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    if response.status() != StatusCode::OK {
        return Err(DnsError::HttpStatus(response.status()).into());
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if content_type != DNS_MESSAGE {
        return Err(DnsError::ContentType(content_type.to_owned()).into());
    }

    let raw_response = Limited::new(response.into_body(), MAX_RESPONSE_SIZE)
        .collect()
        .await
        .map_err(|err| {
            if err.is::<LengthLimitError>() {
                Error::from(DnsError::ResponseTooLarge)
            } else {
                Error::Other(err)
            }
        })?
        .to_bytes();
    if let Some(observe) = observe {
        observe(&raw_response);
    }

    Ok(DnsResponse::parse(query, &raw_response)?)
}

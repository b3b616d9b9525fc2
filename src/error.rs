//! Errors produced by pipeline operations.
//!
//! Every [`Func`](crate::Func) in this crate fails with [`Error`], so that
//! operations compose without error conversion glue. The variants preserve the
//! original error value: classification (see [`crate::errclass`]) only ever
//! inspects errors, it never rewrites them.

use std::io;

use thiserror::Error;

use crate::context::ContextError;
use crate::dns::DnsError;

/// A type-erased error, used for foreign errors flowing into a pipeline.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error returned by pipeline operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error, including dial failures and errors on closed connections.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The TLS handshake failed.
    #[error("tls handshake failed")]
    Tls(#[source] io::Error),

    /// The execution context was cancelled or its deadline expired.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The HTTP round trip failed.
    #[error("http: {0}")]
    Http(#[from] hyper::Error),

    /// An HTTP request could not be constructed.
    #[error("http request: {0}")]
    HttpRequest(#[from] http::Error),

    /// A DNS message could not be built, decoded or validated.
    #[error("dns: {0}")]
    Dns(#[from] DnsError),

    /// A single-use dialer was asked for its connection more than once.
    #[error("single-use dialer: the connection has already been used")]
    SingleUseDial,

    /// Any other error, usually produced by a [`FuncAdapter`](crate::FuncAdapter).
    #[error(transparent)]
    Other(BoxError),
}

impl Error {
    /// Wrap a foreign error.
    pub fn other<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Other(error.into())
    }

    /// Returns true if this error reports use of an already closed connection.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::Io(err) | Error::Tls(err) => is_closed(err),
            _ => false,
        }
    }
}

/// Sentinel reported by connections which have already been closed.
///
/// Every connection wrapper returns this (wrapped in an [`io::Error`]) from a
/// second `close`, and from any I/O attempted after the connection was closed.
#[derive(Debug, Clone, Copy, Default, Error, PartialEq, Eq)]
#[error("use of closed network connection")]
pub struct ConnectionClosed;

impl From<ConnectionClosed> for io::Error {
    fn from(value: ConnectionClosed) -> Self {
        io::Error::new(io::ErrorKind::NotConnected, value)
    }
}

/// Build the [`io::Error`] reported on closed connections.
pub(crate) fn closed() -> io::Error {
    ConnectionClosed.into()
}

/// Returns true if `err` wraps [`ConnectionClosed`].
pub fn is_closed(err: &io::Error) -> bool {
    err.get_ref()
        .map(|inner| inner.is::<ConnectionClosed>())
        .unwrap_or(false)
}

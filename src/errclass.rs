//! Error classification for the `errClass` log field.
//!
//! A classifier maps an error to a short categorical label. Labels exist only
//! for analytics: no primitive ever branches on them, and classifying an error
//! never alters the error returned to the caller.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::context::ContextError;
use crate::dns::DnsError;
use crate::error::{ConnectionClosed, Error};
use crate::tls::CertificateError;

/// Maps an error to a short label.
pub trait ErrClassifier: fmt::Debug + Send + Sync {
    /// Classify `err`. Implementations may return an empty label.
    fn classify(&self, err: &(dyn StdError + 'static)) -> String;
}

/// The classifier installed by [`Config::new`](crate::Config::new): every
/// error is labelled with the empty string.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrClassifier;

impl ErrClassifier for DefaultErrClassifier {
    fn classify(&self, _err: &(dyn StdError + 'static)) -> String {
        String::new()
    }
}

/// Adapts a closure into an [`ErrClassifier`].
#[derive(Clone)]
pub struct ErrClassifierFn<F>(pub F);

impl<F> fmt::Debug for ErrClassifierFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrClassifierFn").finish()
    }
}

impl<F> ErrClassifier for ErrClassifierFn<F>
where
    F: Fn(&(dyn StdError + 'static)) -> String + Send + Sync,
{
    fn classify(&self, err: &(dyn StdError + 'static)) -> String {
        (self.0)(err)
    }
}

impl<C> ErrClassifier for std::sync::Arc<C>
where
    C: ErrClassifier + ?Sized,
{
    fn classify(&self, err: &(dyn StdError + 'static)) -> String {
        (**self).classify(err)
    }
}

/// Classify an optional error, yielding the empty label for `None`.
pub fn classify_opt(
    classifier: &dyn ErrClassifier,
    err: Option<&(dyn StdError + 'static)>,
) -> String {
    err.map(|err| classifier.classify(err)).unwrap_or_default()
}

/// The local address is already in use.
pub const EADDRINUSE: &str = "EADDRINUSE";
/// The local address cannot be assigned.
pub const EADDRNOTAVAIL: &str = "EADDRNOTAVAIL";
/// The connection was aborted locally.
pub const ECONNABORTED: &str = "ECONNABORTED";
/// The peer refused the connection.
pub const ECONNREFUSED: &str = "ECONNREFUSED";
/// The peer reset the connection.
pub const ECONNRESET: &str = "ECONNRESET";
/// No route to the host.
pub const EHOSTUNREACH: &str = "EHOSTUNREACH";
/// The operation was interrupted or cancelled.
pub const EINTR: &str = "EINTR";
/// An argument was invalid.
pub const EINVAL: &str = "EINVAL";
/// The network is down.
pub const ENETDOWN: &str = "ENETDOWN";
/// The network is unreachable.
pub const ENETUNREACH: &str = "ENETUNREACH";
/// No buffer space available.
pub const ENOBUFS: &str = "ENOBUFS";
/// The socket is not connected.
pub const ENOTCONN: &str = "ENOTCONN";
/// The protocol is not supported.
pub const EPROTONOSUPPORT: &str = "EPROTONOSUPPORT";
/// The operation timed out.
pub const ETIMEDOUT: &str = "ETIMEDOUT";
/// The peer closed the stream unexpectedly.
pub const EOF: &str = "EOF";
/// Use of an already closed connection.
pub const ECLOSED: &str = "ECLOSED";
/// The certificate is not valid for the server name.
pub const ETLSHOSTNAME: &str = "ETLSHOSTNAME";
/// The certificate was issued by an unknown authority.
pub const ETLSCAUNKNOWN: &str = "ETLSCAUNKNOWN";
/// The certificate is invalid.
pub const ETLSINVALIDCERT: &str = "ETLSINVALIDCERT";
/// Any other TLS failure.
pub const ETLS: &str = "ETLS";
/// The DNS server answered NXDOMAIN.
pub const EDNS_NONAME: &str = "EDNS_NONAME";
/// The DNS server answered SERVFAIL.
pub const EDNS_SERVFAIL: &str = "EDNS_SERVFAIL";
/// The DNS server answered REFUSED.
pub const EDNS_REFUSED: &str = "EDNS_REFUSED";
/// The DNS response carried no records of the requested type.
pub const EDNS_NODATA: &str = "EDNS_NODATA";
/// Any other DNS failure.
pub const EDNS: &str = "EDNS";
/// Any other HTTP failure.
pub const EHTTP: &str = "EHTTP";
/// An error no other label matches.
pub const EGENERIC: &str = "EGENERIC";

/// Stock classifier producing errno-style labels.
///
/// The error and its sources are inspected outermost first. The first
/// recognised error decides the label; unrecognised errors are [`EGENERIC`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrClass;

impl ErrClassifier for ErrClass {
    fn classify(&self, err: &(dyn StdError + 'static)) -> String {
        classify_error(err).unwrap_or(EGENERIC).to_owned()
    }
}

fn classify_error(err: &(dyn StdError + 'static)) -> Option<&'static str> {
    if let Some(err) = err.downcast_ref::<Error>() {
        return classify_pipeline(err);
    }

    if let Some(err) = err.downcast_ref::<io::Error>() {
        return classify_io(err);
    }

    if let Some(err) = err.downcast_ref::<ContextError>() {
        return Some(classify_context(*err));
    }

    if err.is::<ConnectionClosed>() {
        return Some(ECLOSED);
    }

    if let Some(err) = err.downcast_ref::<CertificateError>() {
        return Some(match err {
            CertificateError::HostnameMismatch { .. } => ETLSHOSTNAME,
            CertificateError::UnknownAuthority { .. } => ETLSCAUNKNOWN,
            CertificateError::Invalid { .. } => ETLSINVALIDCERT,
        });
    }

    if let Some(err) = err.downcast_ref::<rustls::Error>() {
        return Some(classify_rustls(err));
    }

    if let Some(err) = err.downcast_ref::<DnsError>() {
        return Some(classify_dns(err));
    }

    if let Some(err) = err.downcast_ref::<hyper::Error>() {
        if err.is_timeout() {
            return Some(ETIMEDOUT);
        }
        return err.source().and_then(classify_error).or(Some(EHTTP));
    }

    err.source().and_then(classify_error)
}

fn classify_pipeline(err: &Error) -> Option<&'static str> {
    match err {
        Error::Io(err) => classify_io(err),
        Error::Tls(err) => classify_io(err).or(Some(ETLS)),
        Error::Context(err) => Some(classify_context(*err)),
        Error::Http(err) => classify_error(err),
        Error::HttpRequest(_) => Some(EHTTP),
        Error::Dns(err) => Some(classify_dns(err)),
        Error::SingleUseDial => Some(EGENERIC),
        Error::Other(err) => classify_error(err.as_ref()),
    }
}

fn classify_io(err: &io::Error) -> Option<&'static str> {
    if let Some(errno) = err.raw_os_error() {
        if let Some(label) = classify_errno(errno) {
            return Some(label);
        }
    }

    // io::Error::source skips the wrapped payload, so descend explicitly.
    if let Some(inner) = err.get_ref() {
        if let Some(label) = classify_error(inner) {
            return Some(label);
        }
    }

    classify_kind(err.kind())
}

fn classify_kind(kind: io::ErrorKind) -> Option<&'static str> {
    use io::ErrorKind::*;
    Some(match kind {
        AddrInUse => EADDRINUSE,
        AddrNotAvailable => EADDRNOTAVAIL,
        ConnectionAborted => ECONNABORTED,
        ConnectionRefused => ECONNREFUSED,
        ConnectionReset => ECONNRESET,
        Interrupted => EINTR,
        InvalidInput => EINVAL,
        NotConnected => ENOTCONN,
        TimedOut => ETIMEDOUT,
        UnexpectedEof => EOF,
        _ => return None,
    })
}

fn classify_context(err: ContextError) -> &'static str {
    match err {
        ContextError::Canceled => EINTR,
        ContextError::DeadlineExceeded => ETIMEDOUT,
    }
}

fn classify_rustls(err: &rustls::Error) -> &'static str {
    match err {
        rustls::Error::InvalidCertificate(rustls::CertificateError::NotValidForName) => {
            ETLSHOSTNAME
        }
        rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer) => {
            ETLSCAUNKNOWN
        }
        rustls::Error::InvalidCertificate(_) => ETLSINVALIDCERT,
        _ => ETLS,
    }
}

fn classify_dns(err: &DnsError) -> &'static str {
    match err {
        DnsError::NoName => EDNS_NONAME,
        DnsError::ServerFailure => EDNS_SERVFAIL,
        DnsError::Refused => EDNS_REFUSED,
        DnsError::NoData => EDNS_NODATA,
        _ => EDNS,
    }
}

#[cfg(unix)]
fn classify_errno(errno: i32) -> Option<&'static str> {
    Some(match errno {
        libc::EADDRINUSE => EADDRINUSE,
        libc::EADDRNOTAVAIL => EADDRNOTAVAIL,
        libc::ECONNABORTED => ECONNABORTED,
        libc::ECONNREFUSED => ECONNREFUSED,
        libc::ECONNRESET => ECONNRESET,
        libc::EHOSTUNREACH => EHOSTUNREACH,
        libc::EINTR => EINTR,
        libc::EINVAL => EINVAL,
        libc::ENETDOWN => ENETDOWN,
        libc::ENETUNREACH => ENETUNREACH,
        libc::ENOBUFS => ENOBUFS,
        libc::ENOTCONN => ENOTCONN,
        libc::EPROTONOSUPPORT => EPROTONOSUPPORT,
        libc::ETIMEDOUT => ETIMEDOUT,
        _ => return None,
    })
}

#[cfg(not(unix))]
fn classify_errno(_errno: i32) -> Option<&'static str> {
    None
}

//! Connection information
//!
//! Addressing metadata is captured once, when a connection enters a wrapper,
//! and reused for every log event the wrapper emits.

use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

use crate::conn::Conn;

/// The transport-layer protocol of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// A TCP stream.
    Tcp,

    /// A connected UDP socket.
    Udp,
}

impl Network {
    /// The protocol name used in log events and dial requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown network name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown network {0:?}")]
pub struct UnknownNetwork(String);

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" | "tcp4" | "tcp6" => Ok(Network::Tcp),
            "udp" | "udp4" | "udp6" => Ok(Network::Udp),
            _ => Err(UnknownNetwork(s.to_owned())),
        }
    }
}

/// The application protocol negotiated through ALPN.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Protocol {
    /// HTTP transports
    Http(http::Version),

    /// Other protocol
    Other(String),
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(version) if *version == http::Version::HTTP_2 => f.write_str("h2"),
            Self::Http(version) if *version == http::Version::HTTP_3 => f.write_str("h3"),
            Self::Http(version) if *version == http::Version::HTTP_10 => f.write_str("http/1.0"),
            Self::Http(_) => f.write_str("http/1.1"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

impl FromStr for Protocol {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http/1.0" => Ok(Self::Http(http::Version::HTTP_10)),
            "http/1.1" => Ok(Self::Http(http::Version::HTTP_11)),
            "h2" => Ok(Self::Http(http::Version::HTTP_2)),
            "h3" => Ok(Self::Http(http::Version::HTTP_3)),
            _ => Ok(Self::Other(s.to_string())),
        }
    }
}

impl Protocol {
    /// Interpret raw ALPN bytes.
    pub fn from_alpn(alpn: &[u8]) -> Self {
        let name = String::from_utf8_lossy(alpn);
        match name.parse() {
            Ok(protocol) => protocol,
            Err(never) => match never {},
        }
    }
}

/// Addressing metadata for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Local socket address, when known.
    pub local_addr: Option<SocketAddr>,

    /// Remote socket address, when known.
    pub remote_addr: Option<SocketAddr>,

    /// Transport-layer protocol.
    pub network: Network,
}

impl ConnectionInfo {
    /// Capture the metadata of `conn`.
    pub fn of<C>(conn: &C) -> Self
    where
        C: Conn + ?Sized,
    {
        Self {
            local_addr: conn.local_addr(),
            remote_addr: conn.remote_addr(),
            network: conn.network(),
        }
    }

    /// The `localAddr` log field.
    pub fn local(&self) -> String {
        format_addr(self.local_addr)
    }

    /// The `remoteAddr` log field.
    pub fn remote(&self) -> String {
        format_addr(self.remote_addr)
    }

    /// The `protocol` log field.
    pub fn protocol(&self) -> &'static str {
        self.network.as_str()
    }
}

pub(crate) fn format_addr(addr: Option<SocketAddr>) -> String {
    addr.map(|addr| addr.to_string()).unwrap_or_default()
}

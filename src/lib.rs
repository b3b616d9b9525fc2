//! Netops
//!
//! Composable, instrumented building blocks for network measurement pipelines.
//!
//! A pipeline is a chain of [`Func`] stages built with the [`compose`]
//! combinators: dial an endpoint with [`ConnectFunc`], log its I/O with
//! [`ObserveFunc`], bind it to a [`Context`] with [`CancelWatchFunc`],
//! optionally negotiate TLS with [`TlsHandshakeFunc`], and finish with an HTTP
//! transport ([`HttpConnFunc`]) or a DNS channel (see [`dns`]). Every stage
//! reports its lifecycle as `tracing` events parented to a [`Logger`] span.
//!
//! ```no_run
//! # async fn run() -> Result<(), netops::Error> {
//! use netops::dns::{DnsOverUdpConnFunc, DnsQuery, RecordType};
//! use netops::{compose5, endpoint_func, CancelWatchFunc, Config, ConnectFunc, Context};
//! use netops::{Func, Logger, Network, ObserveFunc, SpanId};
//!
//! let config = Config::new();
//! let logger = Logger::current().with_span_id(&SpanId::new());
//! let pipeline = compose5(
//!     endpoint_func("8.8.8.8:53".parse().unwrap()),
//!     ConnectFunc::new(&config, Network::Udp, logger.clone()),
//!     ObserveFunc::new(&config, logger.clone()),
//!     CancelWatchFunc::new(&config),
//!     DnsOverUdpConnFunc::new(&config, logger),
//! );
//!
//! let ctx = Context::background();
//! let conn = pipeline.call(&ctx, ()).await?;
//! let response = conn.exchange(&ctx, &DnsQuery::new("dns.google", RecordType::A)).await?;
//! println!("{:?}", response.records_a()?);
//! conn.close()?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod body;
pub use body::Body;
pub mod bridge;
pub mod cancelwatch;
pub use cancelwatch::{CancelWatchConn, CancelWatchFunc};
pub mod compose;
pub use compose::{
    apply, compose2, compose3, compose4, compose5, compose6, compose7, compose8, const_func,
    endpoint_func,
};
pub mod config;
pub use config::{Clock, Config};
pub mod conn;
pub use conn::{BoxConn, Conn, ConnExt, NetConn};
pub mod connect;
pub use connect::{ConnectFunc, Dialer, NetDialer, NetDialerConfig};
pub mod context;
pub use context::{Context, ContextError};
pub mod dns;
pub mod errclass;
pub use errclass::ErrClassifier;
pub mod error;
pub use error::{BoxError, ConnectionClosed, Error};
pub mod func;
pub use func::{Func, FuncAdapter, ServiceFunc, Unit};
pub mod http;
pub use http::{HttpConn, HttpConnFunc};
pub mod info;
pub use info::{ConnectionInfo, Network};
pub mod observe;
pub use observe::{ObserveConn, ObserveFunc};
pub mod slog;
pub use slog::Logger;
pub mod spanid;
pub use spanid::SpanId;
pub mod tls;
pub use tls::{TlsConfig, TlsHandshakeFunc};

#[cfg(test)]
pub(crate) mod fixtures;

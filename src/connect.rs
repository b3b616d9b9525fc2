//! The connect primitive and the dialers it delegates to.
//!
//! [`ConnectFunc`] turns a resolved endpoint into a connection through a
//! [`Dialer`]. Dialing is the only pipeline step which observes the context
//! on its own: a done context aborts the dial.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::net::{TcpSocket, UdpSocket};
use tracing::{trace, warn};

use crate::config::{Clock, Config};
use crate::conn::{BoxConn, NetConn};
use crate::context::Context;
use crate::errclass::{classify_opt, ErrClassifier};
use crate::error::Error;
use crate::func::Func;
use crate::info::{format_addr, Network};
use crate::slog::{self, Logger};

/// Establishes connections.
pub trait Dialer: fmt::Debug + Send + Sync {
    /// Dial `address` over `network`, giving up when `ctx` is done.
    fn dial<'a>(
        &'a self,
        ctx: &'a Context,
        network: Network,
        address: &'a str,
    ) -> BoxFuture<'a, io::Result<BoxConn>>;
}

impl<D> Dialer for Arc<D>
where
    D: Dialer + ?Sized,
{
    fn dial<'a>(
        &'a self,
        ctx: &'a Context,
        network: Network,
        address: &'a str,
    ) -> BoxFuture<'a, io::Result<BoxConn>> {
        (**self).dial(ctx, network, address)
    }
}

/// Socket options applied by [`NetDialer`].
#[derive(Debug, Clone)]
pub struct NetDialerConfig {
    /// Upper bound on a single dial, on top of the context deadline.
    pub connect_timeout: Option<Duration>,

    /// TCP keep-alive idle time.
    pub keep_alive_timeout: Option<Duration>,

    /// The local IPv4 address to bind to.
    pub local_address_ipv4: Option<Ipv4Addr>,

    /// The local IPv6 address to bind to.
    pub local_address_ipv6: Option<Ipv6Addr>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Whether to reuse the local address.
    pub reuse_address: bool,

    /// The size of the send buffer.
    pub send_buffer_size: Option<usize>,

    /// The size of the receive buffer.
    pub recv_buffer_size: Option<usize>,
}

impl Default for NetDialerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            keep_alive_timeout: Some(Duration::from_secs(15)),
            local_address_ipv4: None,
            local_address_ipv6: None,
            nodelay: true,
            reuse_address: false,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

/// Dials TCP and UDP sockets with the operating system.
#[derive(Debug, Clone, Default)]
pub struct NetDialer {
    config: Arc<NetDialerConfig>,
}

impl NetDialer {
    /// A dialer applying `config` to every socket.
    pub fn new(config: NetDialerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// The socket options in use.
    pub fn config(&self) -> &NetDialerConfig {
        &self.config
    }

    async fn connect(&self, network: Network, address: &str) -> io::Result<BoxConn> {
        let addr = resolve(address).await?;
        let conn = match network {
            Network::Tcp => NetConn::tcp(connect_tcp(&addr, &self.config)?.await?),
            Network::Udp => NetConn::udp(connect_udp(&addr, &self.config).await?),
        };
        Ok(Box::new(conn))
    }
}

impl Dialer for NetDialer {
    fn dial<'a>(
        &'a self,
        ctx: &'a Context,
        network: Network,
        address: &'a str,
    ) -> BoxFuture<'a, io::Result<BoxConn>> {
        Box::pin(async move {
            if let Some(err) = ctx.err() {
                return Err(err.into());
            }

            let connect = async {
                match self.config.connect_timeout {
                    Some(dur) => match tokio::time::timeout(dur, self.connect(network, address)).await
                    {
                        Ok(res) => res,
                        Err(elapsed) => {
                            trace!(timeout = ?dur, "connection timed out");
                            Err(io::Error::new(io::ErrorKind::TimedOut, elapsed))
                        }
                    },
                    None => self.connect(network, address).await,
                }
            };

            tokio::select! {
                biased;
                _ = ctx.done() => Err(ctx.err().map(io::Error::from).unwrap_or_else(|| io::ErrorKind::Interrupted.into())),
                res = connect => res,
            }
        })
    }
}

async fn resolve(address: &str) -> io::Result<SocketAddr> {
    if let Ok(addr) = address.parse() {
        return Ok(addr);
    }

    tokio::net::lookup_host(address).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no addresses found for {address}"),
        )
    })
}

fn bind_local_address(
    socket: &socket2::Socket,
    dst_addr: &SocketAddr,
    local_addr_ipv4: &Option<Ipv4Addr>,
    local_addr_ipv6: &Option<Ipv6Addr>,
) -> io::Result<()> {
    match (*dst_addr, local_addr_ipv4, local_addr_ipv6) {
        (SocketAddr::V4(_), Some(addr), _) => {
            socket.bind(&SocketAddr::new((*addr).into(), 0).into())?;
        }
        (SocketAddr::V6(_), _, Some(addr)) => {
            socket.bind(&SocketAddr::new((*addr).into(), 0).into())?;
        }
        _ => {}
    }

    Ok(())
}

fn connect_tcp(
    addr: &SocketAddr,
    config: &NetDialerConfig,
) -> io::Result<impl std::future::Future<Output = io::Result<tokio::net::TcpStream>>> {
    use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    trace!("tcp socket opened");

    // When constructing a Tokio `TcpSocket` from a std socket, the caller is
    // responsible for ensuring O_NONBLOCK is set.
    socket.set_nonblocking(true)?;

    if let Some(dur) = config.keep_alive_timeout {
        let conf = TcpKeepalive::new().with_time(dur);
        if let Err(e) = socket.set_tcp_keepalive(&conf) {
            warn!("tcp set_keepalive error: {}", e);
        }
    }

    if config.nodelay {
        if let Err(e) = socket.set_nodelay(true) {
            warn!("tcp set_nodelay error: {}", e);
        }
    }

    bind_local_address(
        &socket,
        addr,
        &config.local_address_ipv4,
        &config.local_address_ipv6,
    )?;

    let socket = TcpSocket::from_std_stream(socket.into());

    if config.reuse_address {
        if let Err(e) = socket.set_reuseaddr(true) {
            warn!("tcp set_reuse_address error: {}", e);
        }
    }

    if let Some(size) = config.send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_buffer_size error: {}", e);
        }
    }

    if let Some(size) = config.recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_recv_buffer_size error: {}", e);
        }
    }

    Ok(socket.connect(*addr))
}

async fn connect_udp(addr: &SocketAddr, config: &NetDialerConfig) -> io::Result<UdpSocket> {
    let local: SocketAddr = match (addr, config.local_address_ipv4, config.local_address_ipv6) {
        (SocketAddr::V4(_), Some(ip), _) => (ip, 0).into(),
        (SocketAddr::V4(_), None, _) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        (SocketAddr::V6(_), _, Some(ip)) => (ip, 0).into(),
        (SocketAddr::V6(_), _, None) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    trace!(remote.addr = %addr, "udp socket connected");
    Ok(socket)
}

/// Dials an endpoint and logs `connectStart` / `connectDone`.
///
/// Dial failures are returned as they are; nothing is retried.
#[derive(Debug, Clone)]
pub struct ConnectFunc {
    /// Dialer used to establish connections.
    pub dialer: Arc<dyn Dialer>,

    /// Classifier for the `errClass` field.
    pub err_classifier: Arc<dyn ErrClassifier>,

    /// Clock for the `t0` and `t` fields.
    pub clock: Clock,

    /// Destination of the log events.
    pub logger: Logger,

    /// Transport protocol to dial.
    pub network: Network,
}

impl ConnectFunc {
    /// Build a connect stage for `network`.
    pub fn new(config: &Config, network: Network, logger: Logger) -> Self {
        Self {
            dialer: config.dialer.clone(),
            err_classifier: config.err_classifier.clone(),
            clock: config.clock.clone(),
            logger,
            network,
        }
    }
}

impl Func<SocketAddr> for ConnectFunc {
    type Output = BoxConn;

    fn call<'a>(&'a self, ctx: &'a Context, endpoint: SocketAddr) -> BoxFuture<'a, Result<BoxConn, Error>> {
        Box::pin(async move {
            let address = endpoint.to_string();
            let protocol = self.network.as_str();

            let t0 = self.clock.now();
            tracing::info!(
                parent: self.logger.span(),
                deadline = %slog::deadline(ctx.deadline()),
                localAddr = "",
                protocol,
                remoteAddr = %address,
                t = %slog::timestamp(t0),
                "connectStart"
            );

            let result = self.dialer.dial(ctx, self.network, &address).await;

            let (local_addr, err) = match &result {
                Ok(conn) => (conn.local_addr(), None),
                Err(err) => (None, Some(err as &(dyn std::error::Error + 'static))),
            };
            tracing::info!(
                parent: self.logger.span(),
                err = %slog::error_message(err),
                errClass = %classify_opt(self.err_classifier.as_ref(), err),
                localAddr = %format_addr(local_addr),
                protocol,
                remoteAddr = %address,
                t0 = %slog::timestamp(t0),
                t = %slog::timestamp(self.clock.now()),
                "connectDone"
            );

            Ok(result?)
        })
    }
}

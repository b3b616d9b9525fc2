//! Socket-backed connections.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{self, ready, Poll};
use std::time::SystemTime;

use futures_util::task::AtomicWaker;
use parking_lot::{Mutex, RwLock};
use tokio::io::ReadBuf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Instant, Sleep};

use super::Conn;
use crate::error::closed;
use crate::info::Network;

/// Canonicalize a socket address, converting IPv4 addresses which are
/// mapped into IPv6 addresses into standard IPv4 addresses.
pub(crate) fn make_canonical(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        std::net::IpAddr::V4(_) => addr,
        std::net::IpAddr::V6(ip) => {
            if let Some(ip) = ip.to_ipv4_mapped() {
                SocketAddr::new(std::net::IpAddr::V4(ip), addr.port())
            } else {
                addr
            }
        }
    }
}

fn timeout() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o timeout")
}

#[derive(Debug)]
enum Socket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

#[derive(Default)]
struct Deadline {
    at: Option<SystemTime>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    fn set(&mut self, at: Option<SystemTime>) {
        self.at = at;
        self.sleep = None;
    }

    /// Ready with an error once the deadline has passed.
    fn poll_expired(&mut self, cx: &mut task::Context<'_>) -> Poll<io::Error> {
        let Some(at) = self.at else {
            return Poll::Pending;
        };

        let remaining = match at.duration_since(SystemTime::now()) {
            Ok(remaining) if !remaining.is_zero() => remaining,
            _ => return Poll::Ready(timeout()),
        };

        let sleep = self
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(Instant::now() + remaining)));
        ready!(sleep.as_mut().poll(cx));
        Poll::Ready(timeout())
    }
}

#[derive(Default)]
struct Direction {
    waker: AtomicWaker,
    deadline: Mutex<Deadline>,
}

impl Direction {
    fn set_deadline(&self, at: Option<SystemTime>) {
        self.deadline.lock().set(at);
        // Re-evaluate pending I/O against the new deadline.
        self.waker.wake();
    }

    fn poll_expired(&self, cx: &mut task::Context<'_>) -> Poll<io::Error> {
        self.deadline.lock().poll_expired(cx)
    }
}

/// A TCP stream or connected UDP socket.
///
/// Closing drops the socket immediately and wakes any task blocked on it.
pub struct NetConn {
    socket: RwLock<Option<Socket>>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    network: Network,
    read: Direction,
    write: Direction,
}

impl fmt::Debug for NetConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetConn")
            .field("network", &self.network)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.socket.read().is_none())
            .finish()
    }
}

impl NetConn {
    /// Wrap a connected TCP stream.
    pub fn tcp(stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok().map(make_canonical);
        let remote_addr = stream.peer_addr().ok().map(make_canonical);
        Self::new(Socket::Tcp(stream), Network::Tcp, local_addr, remote_addr)
    }

    /// Wrap a connected UDP socket.
    pub fn udp(socket: UdpSocket) -> Self {
        let local_addr = socket.local_addr().ok().map(make_canonical);
        let remote_addr = socket.peer_addr().ok().map(make_canonical);
        Self::new(Socket::Udp(socket), Network::Udp, local_addr, remote_addr)
    }

    fn new(
        socket: Socket,
        network: Network,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            socket: RwLock::new(Some(socket)),
            local_addr,
            remote_addr,
            network,
            read: Direction::default(),
            write: Direction::default(),
        }
    }
}

impl Conn for NetConn {
    fn poll_read(
        &self,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.read.waker.register(cx.waker());

        let socket = self.socket.read();
        let Some(socket) = socket.as_ref() else {
            return Poll::Ready(Err(closed()));
        };

        if let Poll::Ready(err) = self.read.poll_expired(cx) {
            return Poll::Ready(Err(err));
        }

        match socket {
            Socket::Tcp(stream) => loop {
                ready!(stream.poll_read_ready(cx))?;
                match stream.try_read(buf.initialize_unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        return Poll::Ready(Ok(()));
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(err) => return Poll::Ready(Err(err)),
                }
            },
            Socket::Udp(socket) => socket.poll_recv(cx, buf),
        }
    }

    fn poll_write(&self, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.write.waker.register(cx.waker());

        let socket = self.socket.read();
        let Some(socket) = socket.as_ref() else {
            return Poll::Ready(Err(closed()));
        };

        if let Poll::Ready(err) = self.write.poll_expired(cx) {
            return Poll::Ready(Err(err));
        }

        match socket {
            Socket::Tcp(stream) => loop {
                ready!(stream.poll_write_ready(cx))?;
                match stream.try_write(buf) {
                    Ok(n) => return Poll::Ready(Ok(n)),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(err) => return Poll::Ready(Err(err)),
                }
            },
            Socket::Udp(socket) => socket.poll_send(cx, buf),
        }
    }

    fn close(&self) -> io::Result<()> {
        let socket = self.socket.write().take();
        match socket {
            Some(socket) => {
                tracing::trace!(network = %self.network, "closing socket");
                drop(socket);
                self.read.waker.wake();
                self.write.waker.wake();
                Ok(())
            }
            None => Err(closed()),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn network(&self) -> Network {
        self.network
    }

    fn set_read_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.read.set_deadline(deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.write.set_deadline(deadline);
        Ok(())
    }
}

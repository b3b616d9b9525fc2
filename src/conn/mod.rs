//! Connections flowing through a pipeline.
//!
//! [`Conn`] is the connection capability every primitive consumes and
//! produces. Unlike [`tokio::io::AsyncRead`], every method takes `&self`: a
//! connection may be closed from one task while another is blocked reading
//! from it, which is how [`CancelWatchFunc`](crate::CancelWatchFunc) turns a
//! done context into a failed read.

use std::fmt;
use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{self, ready, Poll};
use std::time::SystemTime;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::closed;
use crate::info::Network;

mod net;

pub use self::net::NetConn;

/// A connected, closeable, bidirectional byte channel.
pub trait Conn: fmt::Debug + Send + Sync + 'static {
    /// Attempt to read into `buf`, registering the current task for wakeup
    /// when no data is available yet.
    fn poll_read(&self, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>)
        -> Poll<io::Result<()>>;

    /// Attempt to write from `buf`.
    fn poll_write(&self, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>>;

    /// Flush buffered writes.
    fn poll_flush(&self, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        let _ = cx;
        Poll::Ready(Ok(()))
    }

    /// Close the connection.
    ///
    /// Pending and future I/O fail with
    /// [`ConnectionClosed`](crate::ConnectionClosed). Closing twice returns
    /// `ConnectionClosed` from the second call.
    fn close(&self) -> io::Result<()>;

    /// Local address, when known.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Remote address, when known.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Transport-layer protocol.
    fn network(&self) -> Network;

    /// Set both the read and the write deadline. `None` clears them.
    fn set_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }

    /// Set the read deadline. Reads pending past it fail with `TimedOut`.
    fn set_read_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()>;

    /// Set the write deadline. Writes pending past it fail with `TimedOut`.
    fn set_write_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()>;
}

/// A type-erased connection, the currency of connection pipelines.
pub type BoxConn = Box<dyn Conn>;

macro_rules! forward_conn {
    () => {
        fn poll_read(
            &self,
            cx: &mut task::Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            (**self).poll_read(cx, buf)
        }

        fn poll_write(&self, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            (**self).poll_write(cx, buf)
        }

        fn poll_flush(&self, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
            (**self).poll_flush(cx)
        }

        fn close(&self) -> io::Result<()> {
            (**self).close()
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            (**self).local_addr()
        }

        fn remote_addr(&self) -> Option<SocketAddr> {
            (**self).remote_addr()
        }

        fn network(&self) -> Network {
            (**self).network()
        }

        fn set_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
            (**self).set_deadline(deadline)
        }

        fn set_read_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
            (**self).set_read_deadline(deadline)
        }

        fn set_write_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
            (**self).set_write_deadline(deadline)
        }
    };
}

impl<C> Conn for Box<C>
where
    C: Conn + ?Sized,
{
    forward_conn!();
}

impl<C> Conn for Arc<C>
where
    C: Conn + ?Sized,
{
    forward_conn!();
}

/// Async helpers for any [`Conn`].
pub trait ConnExt: Conn {
    /// Read some bytes into `buf`, returning how many were read.
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        poll_fn(move |cx| {
            let mut read_buf = ReadBuf::new(&mut *buf);
            ready!(self.poll_read(cx, &mut read_buf))?;
            Poll::Ready(Ok(read_buf.filled().len()))
        })
    }

    /// Fill `buf` completely, failing with `UnexpectedEof` if the peer stops
    /// sending first.
    fn read_exact<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<()>> + Send + 'a {
        let mut filled = 0;
        poll_fn(move |cx| {
            while filled < buf.len() {
                let mut read_buf = ReadBuf::new(&mut buf[filled..]);
                ready!(self.poll_read(cx, &mut read_buf))?;
                let n = read_buf.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                filled += n;
            }
            Poll::Ready(Ok(()))
        })
    }

    /// Write some bytes from `buf`, returning how many were written.
    fn write<'a>(&'a self, buf: &'a [u8]) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        poll_fn(move |cx| self.poll_write(cx, buf))
    }

    /// Write all of `buf`.
    fn write_all<'a>(&'a self, buf: &'a [u8]) -> impl Future<Output = io::Result<()>> + Send + 'a {
        let mut written = 0;
        poll_fn(move |cx| {
            while written < buf.len() {
                let n = ready!(self.poll_write(cx, &buf[written..]))?;
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                written += n;
            }
            ready!(self.poll_flush(cx))?;
            Poll::Ready(Ok(()))
        })
    }
}

impl<C> ConnExt for C where C: Conn + ?Sized {}

/// Adapts a [`Conn`] to tokio's I/O traits, for TLS engines and wire codecs.
///
/// Shutting down the adapter does not close the connection; ownership of the
/// close stays with whoever owns the [`Conn`].
#[derive(Debug)]
pub struct ConnIo<C> {
    conn: C,
}

impl<C> ConnIo<C> {
    /// Adapt `conn`.
    pub fn new(conn: C) -> Self {
        Self { conn }
    }

    /// The adapted connection.
    pub fn get_ref(&self) -> &C {
        &self.conn
    }

    /// Unwrap the adapted connection.
    pub fn into_inner(self) -> C {
        self.conn
    }
}

impl<C> AsyncRead for ConnIo<C>
where
    C: Conn + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.conn.poll_read(cx, buf)
    }
}

impl<C> AsyncWrite for ConnIo<C>
where
    C: Conn + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.conn.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        self.conn.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        self.conn.poll_flush(cx)
    }
}

/// One-shot close gate shared by connection wrappers.
#[derive(Debug, Default)]
pub(crate) struct CloseOnce(AtomicBool);

impl CloseOnce {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run `close` if this is the first call, otherwise report the connection
    /// as already closed.
    pub(crate) fn close<F>(&self, close: F) -> io::Result<()>
    where
        F: FnOnce() -> io::Result<()>,
    {
        if self.0.swap(true, Ordering::AcqRel) {
            return Err(closed());
        }
        close()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

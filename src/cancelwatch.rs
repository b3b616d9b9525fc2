//! Binding a context's lifetime to a connection.
//!
//! Established connections do not watch the context on their own: a read
//! blocked on a silent peer stays blocked after the context deadline passes.
//! [`CancelWatchFunc`] registers a callback which closes the connection as soon
//! as the context is done, so the blocked call fails with
//! [`ConnectionClosed`](crate::ConnectionClosed).

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{self, Poll};
use std::time::SystemTime;

use futures_util::future::BoxFuture;
use tokio::io::ReadBuf;

use crate::config::Config;
use crate::conn::{BoxConn, Conn};
use crate::context::{AfterFunc, Context};
use crate::error::{closed, Error};
use crate::func::Func;
use crate::info::Network;

/// Wraps a connection so it is closed when the context becomes done.
#[derive(Debug, Clone, Default)]
pub struct CancelWatchFunc;

impl CancelWatchFunc {
    /// Build a cancel-watch stage.
    pub fn new(_config: &Config) -> Self {
        Self
    }
}

impl Func<BoxConn> for CancelWatchFunc {
    type Output = BoxConn;

    fn call<'a>(&'a self, ctx: &'a Context, conn: BoxConn) -> BoxFuture<'a, Result<BoxConn, Error>> {
        let conn: BoxConn = Box::new(CancelWatchConn::new(ctx, conn));
        Box::pin(async move { Ok(conn) })
    }
}

/// A connection closed by whichever comes first: an explicit
/// [`close`](Conn::close) or the bound context becoming done.
///
/// Both paths go through one gate, so the wrapped connection is closed at most
/// once no matter how they race.
pub struct CancelWatchConn {
    inner: Arc<dyn Conn>,
    closed: Arc<AtomicBool>,
    watch: AfterFunc,
}

impl fmt::Debug for CancelWatchConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelWatchConn")
            .field("inner", &self.inner)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl CancelWatchConn {
    /// Watch `ctx` on behalf of `conn`.
    pub fn new(ctx: &Context, conn: BoxConn) -> Self {
        let inner: Arc<dyn Conn> = Arc::from(conn);
        let closed = Arc::new(AtomicBool::new(false));

        let watch = ctx.after_func({
            let inner = inner.clone();
            let closed = closed.clone();
            move || {
                if !closed.swap(true, Ordering::AcqRel) {
                    tracing::trace!("context done, closing connection");
                    let _ = inner.close();
                }
            }
        });

        Self {
            inner,
            closed,
            watch,
        }
    }

    /// The watched connection.
    pub fn get_ref(&self) -> &dyn Conn {
        self.inner.as_ref()
    }
}

impl Drop for CancelWatchConn {
    fn drop(&mut self) {
        self.watch.stop();
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.inner.close();
        }
    }
}

impl Conn for CancelWatchConn {
    fn poll_read(
        &self,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.inner.poll_read(cx, buf)
    }

    fn poll_write(&self, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.inner.poll_write(cx, buf)
    }

    fn poll_flush(&self, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_flush(cx)
    }

    fn close(&self) -> io::Result<()> {
        self.watch.stop();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(closed());
        }
        self.inner.close()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr()
    }

    fn network(&self) -> Network {
        self.inner.network()
    }

    fn set_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.inner.set_deadline(deadline)
    }

    fn set_read_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.inner.set_read_deadline(deadline)
    }

    fn set_write_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.inner.set_write_deadline(deadline)
    }
}

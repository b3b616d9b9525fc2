//! Per-operation logging of a connection.
//!
//! [`ObserveConn`] logs every read, write, deadline change and close of the
//! connection it wraps. Reads and writes are logged at `DEBUG` as
//! `readStart`/`readDone` and `writeStart`/`writeDone`; deadline changes as a
//! single `setDeadline`, `setReadDeadline` or `setWriteDeadline` event; the
//! first close as `closeStart`/`closeDone` at `INFO`.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{self, Poll};
use std::time::SystemTime;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::ReadBuf;

use crate::config::{Clock, Config};
use crate::conn::{BoxConn, CloseOnce, Conn};
use crate::context::Context;
use crate::errclass::{classify_opt, ErrClassifier};
use crate::error::Error;
use crate::func::Func;
use crate::info::{ConnectionInfo, Network};
use crate::slog::{self, Logger};

/// Wraps connections in an [`ObserveConn`].
#[derive(Debug, Clone)]
pub struct ObserveFunc {
    /// Classifier for the `errClass` field.
    pub err_classifier: Arc<dyn ErrClassifier>,

    /// Clock for event timestamps.
    pub clock: Clock,

    /// Destination of the log events.
    pub logger: Logger,
}

impl ObserveFunc {
    /// Build an observe stage.
    pub fn new(config: &Config, logger: Logger) -> Self {
        Self {
            err_classifier: config.err_classifier.clone(),
            clock: config.clock.clone(),
            logger,
        }
    }
}

impl Func<BoxConn> for ObserveFunc {
    type Output = BoxConn;

    fn call<'a>(&'a self, _ctx: &'a Context, conn: BoxConn) -> BoxFuture<'a, Result<BoxConn, Error>> {
        let conn: BoxConn = Box::new(ObserveConn::new(
            conn,
            self.err_classifier.clone(),
            self.clock.clone(),
            self.logger.clone(),
        ));
        Box::pin(async move { Ok(conn) })
    }
}

/// I/O in flight in one direction. Polling may take several calls, but the
/// start event is logged once, on the first poll.
#[derive(Debug, Default)]
struct Pending {
    t0: Option<SystemTime>,
}

/// A connection which logs every operation performed on it.
pub struct ObserveConn {
    inner: BoxConn,
    info: ConnectionInfo,
    err_classifier: Arc<dyn ErrClassifier>,
    clock: Clock,
    logger: Logger,
    read: Mutex<Pending>,
    write: Mutex<Pending>,
    close: CloseOnce,
}

impl fmt::Debug for ObserveConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserveConn")
            .field("inner", &self.inner)
            .field("info", &self.info)
            .finish()
    }
}

impl ObserveConn {
    /// Observe `conn`. Addressing metadata is captured now.
    pub fn new(
        conn: BoxConn,
        err_classifier: Arc<dyn ErrClassifier>,
        clock: Clock,
        logger: Logger,
    ) -> Self {
        let info = ConnectionInfo::of(&*conn);
        Self {
            inner: conn,
            info,
            err_classifier,
            clock,
            logger,
            read: Mutex::new(Pending::default()),
            write: Mutex::new(Pending::default()),
            close: CloseOnce::new(),
        }
    }

    /// The observed connection.
    pub fn get_ref(&self) -> &dyn Conn {
        self.inner.as_ref()
    }

    fn classify(&self, err: Option<&io::Error>) -> (String, String) {
        let err = err.map(|err| err as &(dyn std::error::Error + 'static));
        (
            slog::error_message(err),
            classify_opt(self.err_classifier.as_ref(), err),
        )
    }

    fn log_deadline(&self, name: &'static str, deadline: Option<SystemTime>) {
        // tracing needs the message to be known at the callsite.
        let deadline = slog::deadline(deadline);
        let t = slog::timestamp(self.clock.now());
        let (local, remote, protocol) = (self.info.local(), self.info.remote(), self.info.protocol());
        match name {
            "setDeadline" => tracing::debug!(
                parent: self.logger.span(),
                deadline = %deadline,
                localAddr = %local,
                protocol,
                remoteAddr = %remote,
                t = %t,
                "setDeadline"
            ),
            "setReadDeadline" => tracing::debug!(
                parent: self.logger.span(),
                deadline = %deadline,
                localAddr = %local,
                protocol,
                remoteAddr = %remote,
                t = %t,
                "setReadDeadline"
            ),
            _ => tracing::debug!(
                parent: self.logger.span(),
                deadline = %deadline,
                localAddr = %local,
                protocol,
                remoteAddr = %remote,
                t = %t,
                "setWriteDeadline"
            ),
        }
    }
}

impl Conn for ObserveConn {
    fn poll_read(
        &self,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut pending = self.read.lock();
        let t0 = *pending.t0.get_or_insert_with(|| {
            let t0 = self.clock.now();
            tracing::debug!(
                parent: self.logger.span(),
                ioBufferSize = buf.remaining(),
                localAddr = %self.info.local(),
                protocol = self.info.protocol(),
                remoteAddr = %self.info.remote(),
                t = %slog::timestamp(t0),
                "readStart"
            );
            t0
        });

        let before = buf.filled().len();
        let Poll::Ready(result) = self.inner.poll_read(cx, buf) else {
            return Poll::Pending;
        };
        pending.t0 = None;
        drop(pending);

        let count = buf.filled().len() - before;
        let (err, err_class) = self.classify(result.as_ref().err());
        tracing::debug!(
            parent: self.logger.span(),
            err = %err,
            errClass = %err_class,
            ioBytesCount = count,
            localAddr = %self.info.local(),
            protocol = self.info.protocol(),
            remoteAddr = %self.info.remote(),
            t0 = %slog::timestamp(t0),
            t = %slog::timestamp(self.clock.now()),
            "readDone"
        );
        Poll::Ready(result)
    }

    fn poll_write(&self, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut pending = self.write.lock();
        let t0 = *pending.t0.get_or_insert_with(|| {
            let t0 = self.clock.now();
            tracing::debug!(
                parent: self.logger.span(),
                ioBufferSize = buf.len(),
                localAddr = %self.info.local(),
                protocol = self.info.protocol(),
                remoteAddr = %self.info.remote(),
                t = %slog::timestamp(t0),
                "writeStart"
            );
            t0
        });

        let Poll::Ready(result) = self.inner.poll_write(cx, buf) else {
            return Poll::Pending;
        };
        pending.t0 = None;
        drop(pending);

        let count = result.as_ref().copied().unwrap_or(0);
        let (err, err_class) = self.classify(result.as_ref().err());
        tracing::debug!(
            parent: self.logger.span(),
            err = %err,
            errClass = %err_class,
            ioBytesCount = count,
            localAddr = %self.info.local(),
            protocol = self.info.protocol(),
            remoteAddr = %self.info.remote(),
            t0 = %slog::timestamp(t0),
            t = %slog::timestamp(self.clock.now()),
            "writeDone"
        );
        Poll::Ready(result)
    }

    fn poll_flush(&self, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_flush(cx)
    }

    fn close(&self) -> io::Result<()> {
        self.close.close(|| {
            let t0 = self.clock.now();
            tracing::info!(
                parent: self.logger.span(),
                localAddr = %self.info.local(),
                protocol = self.info.protocol(),
                remoteAddr = %self.info.remote(),
                t = %slog::timestamp(t0),
                "closeStart"
            );

            let result = self.inner.close();

            let (err, err_class) = self.classify(result.as_ref().err());
            tracing::info!(
                parent: self.logger.span(),
                err = %err,
                errClass = %err_class,
                localAddr = %self.info.local(),
                protocol = self.info.protocol(),
                remoteAddr = %self.info.remote(),
                t0 = %slog::timestamp(t0),
                t = %slog::timestamp(self.clock.now()),
                "closeDone"
            );
            result
        })
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.info.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.info.remote_addr
    }

    fn network(&self) -> Network {
        self.info.network
    }

    fn set_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.log_deadline("setDeadline", deadline);
        self.inner.set_deadline(deadline)
    }

    fn set_read_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.log_deadline("setReadDeadline", deadline);
        self.inner.set_read_deadline(deadline)
    }

    fn set_write_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.log_deadline("setWriteDeadline", deadline);
        self.inner.set_write_deadline(deadline)
    }
}

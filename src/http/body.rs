use std::error::Error as StdError;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, UNIX_EPOCH};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use hyper::body::Incoming;
use parking_lot::Mutex;

use crate::config::Clock;
use crate::errclass::ErrClassifier;
use crate::error::{closed, BoxError};
use crate::info::ConnectionInfo;
use crate::slog::{self, Logger};

/// A response body whose streaming is logged.
///
/// The first poll emits `httpBodyStreamStart`. Closing the body, with
/// [`close`](ObservedBody::close) or by dropping it, emits
/// `httpBodyStreamDone` carrying the first error seen while streaming, but
/// only if the body was polled at least once. An untouched body closes
/// silently.
pub struct ObservedBody<B = Incoming> {
    inner: Option<B>,
    observer: BodyObserver,
}

impl<B> fmt::Debug for ObservedBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservedBody")
            .field("open", &self.inner.is_some())
            .field("started", &self.observer.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl<B> ObservedBody<B> {
    pub(crate) fn new(
        inner: B,
        info: ConnectionInfo,
        err_classifier: Arc<dyn ErrClassifier>,
        clock: Clock,
        logger: Logger,
    ) -> Self {
        Self {
            inner: Some(inner),
            observer: BodyObserver {
                info,
                err_classifier,
                clock,
                logger,
                read_once: AtomicBool::new(false),
                close_once: AtomicBool::new(false),
                started: AtomicBool::new(false),
                t0: AtomicU64::new(0),
                first_error: Mutex::new(None),
            },
        }
    }

    /// Release the underlying body. Later polls fail with
    /// [`ConnectionClosed`](crate::ConnectionClosed).
    pub fn close(&mut self) {
        self.inner.take();
        self.observer.done();
    }
}

impl<B> Drop for ObservedBody<B> {
    fn drop(&mut self) {
        self.inner.take();
        self.observer.done();
    }
}

impl<B> Body for ObservedBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(Some(Err(closed().into())));
        };

        this.observer.start();
        match Pin::new(inner).poll_frame(cx) {
            Poll::Ready(Some(Err(err))) => {
                let err: BoxError = err.into();
                this.observer.record_error(err.as_ref());
                Poll::Ready(Some(Err(err)))
            }
            other => other.map(|frame| frame.map(|res| res.map_err(Into::into))),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.as_ref().map_or(true, |inner| inner.is_end_stream())
    }

    fn size_hint(&self) -> SizeHint {
        self.inner
            .as_ref()
            .map_or_else(|| SizeHint::with_exact(0), |inner| inner.size_hint())
    }
}

struct BodyObserver {
    info: ConnectionInfo,
    err_classifier: Arc<dyn ErrClassifier>,
    clock: Clock,
    logger: Logger,
    read_once: AtomicBool,
    close_once: AtomicBool,
    started: AtomicBool,
    t0: AtomicU64,
    first_error: Mutex<Option<(String, String)>>,
}

impl BodyObserver {
    fn start(&self) {
        if self.read_once.swap(true, Ordering::AcqRel) {
            return;
        }

        let t0 = self.clock.now();
        let nanos = t0
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        self.t0
            .store(u64::try_from(nanos).unwrap_or(u64::MAX), Ordering::Relaxed);
        // Publishes t0 to `done`.
        self.started.store(true, Ordering::Release);

        tracing::info!(
            parent: self.logger.span(),
            localAddr = %self.info.local(),
            protocol = self.info.protocol(),
            remoteAddr = %self.info.remote(),
            t = %slog::timestamp(t0),
            "httpBodyStreamStart"
        );
    }

    fn record_error(&self, err: &(dyn StdError + 'static)) {
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some((err.to_string(), self.err_classifier.classify(err)));
        }
    }

    fn done(&self) {
        if self.close_once.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.started.load(Ordering::Acquire) {
            return;
        }

        let t0 = UNIX_EPOCH + Duration::from_nanos(self.t0.load(Ordering::Relaxed));
        let (err, err_class) = self.first_error.lock().clone().unwrap_or_default();
        tracing::info!(
            parent: self.logger.span(),
            err = %err,
            errClass = %err_class,
            localAddr = %self.info.local(),
            protocol = self.info.protocol(),
            remoteAddr = %self.info.remote(),
            t0 = %slog::timestamp(t0),
            t = %slog::timestamp(self.clock.now()),
            "httpBodyStreamDone"
        );
    }
}

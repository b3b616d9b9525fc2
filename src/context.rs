//! Cancellable, deadline-carrying execution contexts.
//!
//! A [`Context`] is threaded through every pipeline operation. Operations never
//! derive, shorten or override it; they only read its deadline for logging and
//! hand it to collaborators (dialers, TLS engines) which may abort on it.
//!
//! Blocking I/O on an established connection does not observe the context by
//! itself. [`Context::after_func`] is the hook used by
//! [`CancelWatchFunc`](crate::CancelWatchFunc) to close connections when the
//! context becomes done.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

/// The reason a [`Context`] is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ContextError {
    /// The context was explicitly cancelled.
    #[error("context canceled")]
    Canceled,

    /// The context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl From<ContextError> for io::Error {
    fn from(value: ContextError) -> Self {
        let kind = match value {
            ContextError::Canceled => io::ErrorKind::Interrupted,
            ContextError::DeadlineExceeded => io::ErrorKind::TimedOut,
        };
        io::Error::new(kind, value)
    }
}

/// An execution context: a deadline plus a cancellation signal.
///
/// Cloning is cheap and clones observe the same cancellation state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context which is never cancelled and has no deadline.
    pub fn background() -> Self {
        Context {
            inner: Arc::new(Inner::new(None)),
        }
    }

    /// Derive a context which is done when `cancel` is called on the returned
    /// handle, or when this context is done.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let child = self.child(self.deadline());
        let handle = CancelHandle {
            inner: Arc::downgrade(&child.inner),
        };
        (child, handle)
    }

    /// Derive a context whose deadline is at most `deadline`.
    ///
    /// Must be called from within a tokio runtime: the deadline is enforced by
    /// a timer task.
    pub fn with_deadline(&self, deadline: SystemTime) -> (Context, CancelHandle) {
        let effective = match self.deadline() {
            Some(parent) if parent <= deadline => parent,
            _ => deadline,
        };
        let child = self.child(Some(effective));

        // The parent timer already covers an earlier or equal deadline.
        if effective == deadline && !child.is_done() {
            match deadline.duration_since(SystemTime::now()) {
                Ok(remaining) if !remaining.is_zero() => {
                    let weak = Arc::downgrade(&child.inner);
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(remaining).await;
                        if let Some(inner) = weak.upgrade() {
                            inner.cancel(ContextError::DeadlineExceeded);
                        }
                    });
                    *child.inner.timer.lock() = Some(timer.abort_handle());
                }
                _ => child.inner.cancel(ContextError::DeadlineExceeded),
            }
        }

        let handle = CancelHandle {
            inner: Arc::downgrade(&child.inner),
        };
        (child, handle)
    }

    /// Derive a context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelHandle) {
        self.with_deadline(SystemTime::now() + timeout)
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<SystemTime> {
        self.inner.deadline
    }

    /// Why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        self.inner.state.lock().err
    }

    /// Returns true once the context has been cancelled or its deadline passed.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Wait until the context is done.
    pub async fn done(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }

    /// Register `f` to run once when this context becomes done.
    ///
    /// If the context is already done, `f` is scheduled on the current tokio
    /// runtime (or run inline outside of a runtime) rather than called
    /// synchronously. The returned [`AfterFunc`] can unregister `f`.
    pub fn after_func<F>(&self, f: F) -> AfterFunc
    where
        F: FnOnce() + Send + 'static,
    {
        let listener = Arc::new(Listener::new(Box::new(f)));
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        if state.err.is_some() {
            drop(state);
            let scheduled = listener.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { scheduled.fire() });
                }
                Err(_) => scheduled.fire(),
            }
        } else {
            state.listeners.push((id, listener.clone()));
        }

        AfterFunc {
            inner: Arc::downgrade(&self.inner),
            id,
            listener,
        }
    }

    fn child(&self, deadline: Option<SystemTime>) -> Context {
        let child = Context {
            inner: Arc::new(Inner::new(deadline)),
        };

        if let Some(err) = self.err() {
            child.inner.cancel(err);
            return child;
        }

        let parent = Arc::downgrade(&self.inner);
        let weak = Arc::downgrade(&child.inner);
        let stop = self.after_func(move || {
            let err = parent
                .upgrade()
                .and_then(|parent| parent.state.lock().err)
                .unwrap_or(ContextError::Canceled);
            if let Some(inner) = weak.upgrade() {
                inner.cancel(err);
            }
        });
        *child.inner.parent.lock() = Some(stop);
        child
    }
}

/// Cancels the [`Context`] it was created with.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    inner: Weak<Inner>,
}

impl CancelHandle {
    /// Cancel the context. Cancelling an already done context has no effect.
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.cancel(ContextError::Canceled);
        }
    }
}

/// Registration handle returned by [`Context::after_func`].
pub struct AfterFunc {
    inner: Weak<Inner>,
    id: u64,
    listener: Arc<Listener>,
}

impl fmt::Debug for AfterFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AfterFunc").field("id", &self.id).finish()
    }
}

impl AfterFunc {
    /// Unregister the callback.
    ///
    /// Returns true if this call prevented the callback from running, false if
    /// it already started or was already stopped.
    pub fn stop(&self) -> bool {
        let stopped = self.listener.stop();
        if stopped {
            if let Some(inner) = self.inner.upgrade() {
                inner.state.lock().listeners.retain(|(id, _)| *id != self.id);
            }
        }
        stopped
    }
}

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const STOPPED: u8 = 2;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Listener {
    state: AtomicU8,
    callback: Mutex<Option<Callback>>,
}

impl Listener {
    fn new(callback: Callback) -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            callback: Mutex::new(Some(callback)),
        }
    }

    fn fire(&self) {
        if self
            .state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let callback = self.callback.lock().take();
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    fn stop(&self) -> bool {
        let stopped = self
            .state
            .compare_exchange(PENDING, STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if stopped {
            self.callback.lock().take();
        }
        stopped
    }
}

#[derive(Default)]
struct State {
    err: Option<ContextError>,
    next_id: u64,
    listeners: Vec<(u64, Arc<Listener>)>,
}

struct Inner {
    deadline: Option<SystemTime>,
    state: Mutex<State>,
    notify: Notify,
    parent: Mutex<Option<AfterFunc>>,
    timer: Mutex<Option<AbortHandle>>,
}

impl Inner {
    fn new(deadline: Option<SystemTime>) -> Self {
        Self {
            deadline,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            parent: Mutex::new(None),
            timer: Mutex::new(None),
        }
    }

    fn cancel(&self, err: ContextError) {
        let listeners = {
            let mut state = self.state.lock();
            if state.err.is_some() {
                return;
            }
            state.err = Some(err);
            std::mem::take(&mut state.listeners)
        };

        self.notify.notify_waiters();
        for (_, listener) in listeners {
            listener.fire();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(parent) = self.parent.get_mut().take() {
            parent.stop();
        }
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}

//! Collaborator defaults shared by every pipeline primitive.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::connect::{Dialer, NetDialer};
use crate::errclass::{DefaultErrClassifier, ErrClassifier};

/// A source of wall-clock time.
///
/// Every timestamp written to the logs, and the time used to validate peer
/// certificates, comes from a `Clock`. Tests substitute a fixed clock.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> SystemTime + Send + Sync + 'static>);

impl Clock {
    /// The system wall clock.
    pub fn system() -> Self {
        Clock(Arc::new(SystemTime::now))
    }

    /// A clock backed by an arbitrary function.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> SystemTime + Send + Sync + 'static,
    {
        Clock(Arc::new(f))
    }

    /// A clock which always reports `at`.
    pub fn fixed(at: SystemTime) -> Self {
        Clock::from_fn(move || at)
    }

    /// Read the current time.
    pub fn now(&self) -> SystemTime {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::system()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Clock").field(&self.now()).finish()
    }
}

/// Defaults injected into every primitive when it is constructed.
///
/// Fields may be overridden before a pipeline first runs. A `Config` may be
/// shared by concurrent pipeline runs, but must not change while they use it.
#[derive(Clone)]
pub struct Config {
    /// Dialer used by [`ConnectFunc`](crate::ConnectFunc).
    pub dialer: Arc<dyn Dialer>,

    /// Classifier producing the `errClass` log field.
    pub err_classifier: Arc<dyn ErrClassifier>,

    /// Clock used for log timestamps and certificate validation.
    pub clock: Clock,
}

impl Config {
    /// A configuration using the socket dialer, the empty error classifier, and
    /// the system clock.
    pub fn new() -> Self {
        Self {
            dialer: Arc::new(NetDialer::default()),
            err_classifier: Arc::new(DefaultErrClassifier),
            clock: Clock::system(),
        }
    }

    /// Replace the dialer.
    pub fn with_dialer<D>(mut self, dialer: D) -> Self
    where
        D: Dialer + 'static,
    {
        self.dialer = Arc::new(dialer);
        self
    }

    /// Replace the error classifier.
    pub fn with_err_classifier<C>(mut self, classifier: C) -> Self
    where
        C: ErrClassifier + 'static,
    {
        self.err_classifier = Arc::new(classifier);
        self
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("dialer", &self.dialer)
            .field("err_classifier", &self.err_classifier)
            .field("clock", &self.clock)
            .finish()
    }
}

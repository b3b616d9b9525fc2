use std::fmt;
use std::io;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use crate::conn::{BoxConn, Conn};
use crate::connect::Dialer;
use crate::context::Context;
use crate::error::Error;
use crate::info::Network;

/// Hands out one already established connection, then refuses to dial.
///
/// HTTP transports dial for themselves. Binding them to this dialer makes
/// them run over the connection the pipeline built, and turns any attempt
/// to reconnect into an error.
pub struct SingleUseDialer {
    conn: Mutex<Option<Arc<dyn Conn>>>,
}

impl fmt::Debug for SingleUseDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleUseDialer")
            .field("used", &self.conn.lock().is_none())
            .finish()
    }
}

impl SingleUseDialer {
    /// A dialer which will return `conn` once.
    pub fn new(conn: Arc<dyn Conn>) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
        }
    }

    /// Take the connection, failing with [`Error::SingleUseDial`] on every
    /// call after the first.
    pub fn take(&self) -> Result<BoxConn, Error> {
        self.conn
            .lock()
            .take()
            .map(|conn| Box::new(conn) as BoxConn)
            .ok_or(Error::SingleUseDial)
    }

    /// Whether the connection was already handed out.
    pub fn is_used(&self) -> bool {
        self.conn.lock().is_none()
    }
}

impl Dialer for SingleUseDialer {
    fn dial<'a>(
        &'a self,
        _ctx: &'a Context,
        _network: Network,
        _address: &'a str,
    ) -> BoxFuture<'a, io::Result<BoxConn>> {
        let result = self.take().map_err(io::Error::other);
        Box::pin(async move { result })
    }
}

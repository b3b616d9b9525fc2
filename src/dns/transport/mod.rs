//! DNS wire transports.
//!
//! Each transport can either dial its own connection through a
//! [`Dialer`](crate::Dialer) or exchange over a connection it is handed. Raw
//! query and response bytes are reported to optional observers as they cross
//! the wire.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::conn::Conn;

mod doh;
mod stream;
mod udp;

pub use self::doh::{new_request, read_response, DNS_MESSAGE, MAX_RESPONSE_SIZE};
pub use self::stream::DnsOverStreamTransport;
pub use self::udp::DnsOverUdpTransport;

/// Callback receiving raw DNS messages.
pub type RawObserver = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Query and response observers shared by the transports.
#[derive(Clone, Default)]
pub struct Observers {
    /// Called with each serialized query before it is sent.
    pub raw_query: Option<RawObserver>,

    /// Called with each raw response as it is received.
    pub raw_response: Option<RawObserver>,
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("raw_query", &self.raw_query.is_some())
            .field("raw_response", &self.raw_response.is_some())
            .finish()
    }
}

impl Observers {
    pub(crate) fn query(&self, raw: &[u8]) {
        if let Some(observe) = &self.raw_query {
            observe(raw);
        }
    }

    pub(crate) fn response(&self, raw: &[u8]) {
        if let Some(observe) = &self.raw_response {
            observe(raw);
        }
    }
}

/// Applies a deadline to a connection for the length of an exchange.
struct DeadlineGuard<'c> {
    conn: &'c dyn Conn,
    armed: bool,
}

impl<'c> DeadlineGuard<'c> {
    fn set(conn: &'c dyn Conn, deadline: Option<SystemTime>) -> std::io::Result<Self> {
        if let Some(deadline) = deadline {
            conn.set_deadline(Some(deadline))?;
        }
        Ok(Self {
            conn,
            armed: deadline.is_some(),
        })
    }
}

impl Drop for DeadlineGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.conn.set_deadline(None);
        }
    }
}

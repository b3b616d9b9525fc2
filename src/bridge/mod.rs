//! Glue between [`Conn`](crate::conn::Conn) and the [hyper] runtime traits.

/// Bridge [`Conn`](crate::conn::Conn) to hyper's I/O traits
pub mod io;

/// Provide runtime interfaces from [tokio] to [hyper]
pub mod rt;

pub use self::io::HyperIo;
pub use self::rt::TokioExecutor;

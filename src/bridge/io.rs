use std::io::Error;
use std::pin::Pin;
use std::task::{Context, Poll};

use hyper::rt::{Read, ReadBufCursor, Write};

use crate::conn::Conn;

/// Drive a [`Conn`] through hyper's I/O traits.
///
/// Shutdown only flushes: the connection is released by closing it, which
/// the owner of the pipeline does explicitly.
#[derive(Debug)]
pub struct HyperIo<C> {
    inner: C,
}

impl<C> HyperIo<C> {
    /// Wrap a connection.
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    /// The wrapped connection.
    pub fn get_ref(&self) -> &C {
        &self.inner
    }
}

impl<C> Read for HyperIo<C>
where
    C: Conn + Unpin,
{
    #[allow(unsafe_code)]
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: ReadBufCursor<'_>,
    ) -> Poll<Result<(), Error>> {
        // SAFETY: `ReadBuf::uninit` never de-initializes memory, and the
        // connection only reports bytes it has written as filled.
        let n = unsafe {
            let mut tbuf = tokio::io::ReadBuf::uninit(buf.as_mut());
            match self.inner.poll_read(cx, &mut tbuf) {
                Poll::Ready(Ok(())) => tbuf.filled().len(),
                other => return other,
            }
        };

        // SAFETY: `n` bytes were initialized by the read above.
        unsafe {
            buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<C> Write for HyperIo<C>
where
    C: Conn + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
        self.inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        self.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        self.inner.poll_flush(cx)
    }
}

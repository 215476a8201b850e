//! Byte-stream plumbing shared by the request and response sides
//!
//! [`CancellableReader`] checks the fetch scope before every read so that
//! a cancelled or expired scope turns the next read into a fast failure.
//! An async read that is waiting on the inner stream also wakes up when
//! the scope finishes, so a stalled body cannot outlive its scope.

use crate::error::ScopeError;
use crate::scope::FetchScope;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::io::{self, Read};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Initial buffer size when the body length is unknown
const INITIAL_CAPACITY: usize = 8 * 1024;

/// Reader that fails with the scope's [`ScopeError`] once the scope is done
///
/// Works over both `tokio::io::AsyncRead` and `std::io::Read` streams. The
/// error surfaces as an `io::Error`; [`FetchError::from_io`] turns it back
/// into the bare scope error. Synchronous reads only check the scope
/// between reads.
///
/// [`FetchError::from_io`]: crate::FetchError
pub struct CancellableReader<R> {
    inner: R,
    scope: FetchScope,
    /// Created the first time the inner stream returns `Pending`
    done: Option<Pin<Box<dyn Future<Output = ScopeError> + Send>>>,
}

impl<R> CancellableReader<R> {
    pub fn new(inner: R, scope: FetchScope) -> Self {
        Self {
            inner,
            scope,
            done: None,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn scope_failure(&self) -> Option<io::Error> {
        self.scope.error().map(ScopeError::into_io)
    }
}

impl<R: fmt::Debug> fmt::Debug for CancellableReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellableReader")
            .field("inner", &self.inner)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CancellableReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = this.scope_failure() {
            return Poll::Ready(Err(err));
        }
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Pending => {
                let scope = &this.scope;
                let done = this.done.get_or_insert_with(|| {
                    let scope = scope.clone();
                    Box::pin(async move { scope.done().await })
                });
                match done.as_mut().poll(cx) {
                    Poll::Ready(err) => Poll::Ready(Err(err.into_io())),
                    Poll::Pending => Poll::Pending,
                }
            }
            ready => ready,
        }
    }
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(err) = self.scope_failure() {
            return Err(err);
        }
        self.inner.read(buf)
    }
}

/// Read at most `max` bytes of `reader` into memory.
///
/// Reads through a `max + 1` byte window: if the extra byte shows up, the
/// result is cut to exactly `max` bytes and flagged as truncated. The
/// buffer never grows past `max + 1` bytes. Read failures, scope
/// cancellation included, are returned as-is for the caller to classify.
pub async fn read_bounded<R>(
    scope: &FetchScope,
    reader: R,
    max: usize,
    size_hint: Option<u64>,
) -> io::Result<(Bytes, bool)>
where
    R: AsyncRead + Unpin,
{
    let limit = max.saturating_add(1);
    let mut limited = CancellableReader::new(reader, scope.clone()).take(limit as u64);

    let initial = size_hint
        .and_then(|n| usize::try_from(n).ok())
        .map(|n| n.saturating_add(1))
        .unwrap_or(INITIAL_CAPACITY)
        .min(limit);
    let mut buf = Vec::with_capacity(initial);

    loop {
        if buf.len() >= limit {
            break;
        }
        if buf.len() == buf.capacity() {
            let grow = buf.capacity().max(INITIAL_CAPACITY).min(limit - buf.len());
            buf.reserve_exact(grow);
        }
        if limited.read_buf(&mut buf).await? == 0 {
            break;
        }
    }

    let truncated = buf.len() > max;
    if truncated {
        buf.truncate(max);
    }
    Ok((Bytes::from(buf), truncated))
}

/// Read up to `n` bytes for diagnostics, stopping early at end of stream
pub(crate) async fn read_prefix<R>(scope: &FetchScope, reader: &mut R, n: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(n);
    CancellableReader::new(reader, scope.clone())
        .take(n as u64)
        .read_to_end(&mut buf)
        .await?;
    Ok(buf)
}

/// Discard up to `n` bytes so the connection can be reused
pub(crate) async fn drain<R>(scope: &FetchScope, reader: &mut R, n: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut limited = CancellableReader::new(reader, scope.clone()).take(n as u64);
    tokio::io::copy(&mut limited, &mut tokio::io::sink()).await
}

//! Runtime-adapter plumbing: wraps smol's async I/O types and executor so
//! `hyper` (which is runtime-agnostic but expects its own `rt::Read`/
//! `rt::Write`/`rt::Executor` traits) can drive connections over them, plus
//! the bidirectional splice used for CONNECT tunnels.

use std::future::Future;
use std::pin::Pin;
use std::ptr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_io::Timer;
use executor_core::{Executor, Task};
use futures_lite::io::{AsyncRead, AsyncWrite};
use futures_lite::FutureExt;
use hyper::rt::Executor as HyperExecutor;

/// Adapts any `futures_lite` `AsyncRead + AsyncWrite` type to `hyper::rt`'s
/// `Read`/`Write` traits.
pub struct ConnectionWrapper<C>(pub C);

impl<C: Unpin + AsyncRead> hyper::rt::Read for ConnectionWrapper<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        let inner = &mut self.get_mut().0;

        // SAFETY: `buf.as_mut()` yields the uninitialized tail of the read
        // buffer; we only write the `n` bytes poll_read reports and then
        // advance by exactly `n`, so no uninitialized byte is ever exposed.
        let buffer = unsafe { &mut *(ptr::from_mut(buf.as_mut()) as *mut [u8]) };

        match Pin::new(inner).poll_read(cx, buffer) {
            Poll::Ready(Ok(n)) => {
                unsafe {
                    buf.advance(n);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<C: Unpin + AsyncWrite> hyper::rt::Write for ConnectionWrapper<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_close(cx)
    }
}

/// Adapts an `executor_core::Executor` to `hyper::rt::Executor`, for
/// driving `hyper`'s connection futures and upgrade continuations.
pub struct ExecutorWrapper<E>(Arc<E>);

impl<E> ExecutorWrapper<E> {
    pub fn new(executor: E) -> Self {
        Self(Arc::new(executor))
    }
}

impl<E> Clone for ExecutorWrapper<E> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<Fut, E> HyperExecutor<Fut> for ExecutorWrapper<E>
where
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
    E: Executor + 'static,
{
    fn execute(&self, fut: Fut) {
        self.0.spawn(fut).detach();
    }
}

/// Adapts `hyper::upgrade::Upgraded` (a raw-byte tunnel after a CONNECT or
/// protocol upgrade) to `futures_lite`'s `AsyncRead`/`AsyncWrite`.
pub struct UpgradedWrapper(pub hyper::upgrade::Upgraded);

impl AsyncRead for UpgradedWrapper {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut read_buf = hyper::rt::ReadBuf::new(buf);
        match hyper::rt::Read::poll_read(Pin::new(&mut self.0), cx, read_buf.unfilled()) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for UpgradedWrapper {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.0), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.0), cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.0), cx)
    }
}

/// Bidirectional byte pump between two async streams, closing after `idle`
/// seconds pass with zero bytes crossing in either direction. This is the
/// splice both a DIRECT CONNECT and an upstream-tunneled CONNECT use once
/// the `200 Connection established` response has already been written.
pub async fn splice_with_idle_timeout<A, B>(a: A, b: B, idle: Duration) -> std::io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    use futures_lite::io::{copy, split};

    let (a_read, a_write) = split(a);
    let (b_read, b_write) = split(b);

    let a_to_b = copy_with_idle(a_read, b_write, idle);
    let b_to_a = copy_with_idle(b_read, a_write, idle);

    let _ = futures_lite::future::zip(a_to_b, b_to_a).await;
    Ok(())
}

async fn copy_with_idle<R, W>(mut reader: R, mut writer: W, idle: Duration)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use futures_lite::{AsyncReadExt, AsyncWriteExt};

    let mut buf = [0u8; 16 * 1024];
    loop {
        let read = reader
            .read(&mut buf)
            .or(async {
                Timer::after(idle).await;
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "idle timeout"))
            })
            .await;

        match read {
            Ok(0) => break,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = writer.close().await;
}

pub fn empty_body() -> http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error> {
    use http_body_util::BodyExt;
    http_body_util::Empty::<bytes::Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full_body(
    s: impl Into<bytes::Bytes>,
) -> http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error> {
    use http_body_util::BodyExt;
    http_body_util::Full::new(s.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Format a `host:port` pair for `TcpStream::connect`, bracketing literal
/// IPv6 addresses.
pub fn format_target_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

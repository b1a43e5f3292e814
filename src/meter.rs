//! Throughput metering for test rigs.
//!
//! [`MeteredReader`] wraps any [`AsyncRead`] and records how many bytes have
//! flowed through it since the first non-empty read, exposing a simple
//! average bytes-per-second figure. The throughput tests use it to assert
//! shaped transfer speeds without pulling in a metrics stack.
use std::{
    pin::Pin,
    task::{ready, Context, Poll},
};

use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, ReadBuf},
    time::Instant,
};

/// Counts bytes read through an [`AsyncRead`] and reports the average rate.
///
/// The clock starts at the first non-empty read, so setup time before the
/// transfer does not dilute the figure.
#[pin_project]
#[derive(Debug)]
pub struct MeteredReader<T> {
    #[pin]
    inner: T,
    total: u64,
    started: Option<Instant>,
}

impl<T> MeteredReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            total: 0,
            started: None,
        }
    }

    /// Total bytes read so far.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Average rate in bytes per second, or `None` before the first byte.
    pub fn rate_bps(&self) -> Option<f64> {
        let started = self.started?;
        let elapsed = started.elapsed().as_secs_f64();
        (elapsed > 0.0).then(|| self.total as f64 / elapsed)
    }

    /// Consumes the meter, returning the wrapped reader.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead> AsyncRead for MeteredReader<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        let n = buf.filled().len() - before;
        if n > 0 {
            this.started.get_or_insert_with(Instant::now);
            *this.total += n as u64;
        }
        Poll::Ready(Ok(()))
    }
}

//! The policed connection wrapper.
//!
//! [`PolicedConn`] wraps one accepted byte stream and paces every outbound
//! chunk against two ceilings: the server-wide rate owned by the
//! [`Policer`](crate::policer::Policer) and this connection's own rate. Reads
//! pass through untouched; egress shaping only.
//!
//! Each `poll_write` admits and forwards **one chunk**: the chunk size is
//! announced to the policer-side admission task, a permit comes back once the
//! global bucket covers it, the connection's own bucket is debited and slept
//! on, and only then does the chunk reach the transport. `write_all` composes
//! whole-buffer delivery from that, and partial byte counts on failure fall
//! out of the standard [`AsyncWrite`] contract.
//!
//! ```no_run
//! use tokio::io::AsyncWriteExt;
//! use tokio::net::TcpListener;
//! use tokio_policer::Policer;
//!
//! # #[tokio::main]
//! # async fn main() -> std::io::Result<()> {
//! let policer = Policer::new(10 * 1024, 2 * 1024); // kB/s
//! let listener = TcpListener::bind("0.0.0.0:9000").await?;
//! let mut conn = policer.wrap(listener.accept().await)?;
//! conn.write_all(b"shaped").await?; // paced against both ceilings
//! conn.set_rate(512);               // this connection alone: 512 kB/s
//! conn.close().await?;
//! # Ok(()) }
//! ```
//!
//! There are no deadline setters here; wrap calls in
//! [`tokio::time::timeout`] instead, and reach transport-specific APIs
//! through [`PolicedConn::get_ref`] / [`PolicedConn::get_mut`].
use std::{
    fmt, io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    task::{ready, Context, Poll},
    time::Duration,
};

use futures::FutureExt;
use pin_project::{pin_project, pinned_drop};
use smallvec::SmallVec;
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    sync::{mpsc, oneshot},
    time::{sleep, Instant, Sleep},
};
use tracing::trace;

use crate::{
    burst::{burst_bytes, BurstFactor, DEFAULT_BURST_FACTOR},
    limiter::RateLimiter,
    policer::{AdmitRequest, Core},
};

/// Inline `IoSlice` capacity for chunk-limited vectored writes.
const INLINE_IOVEC: usize = 16;

/// Error returned by [`PolicedConn::close`] once the connection has already
/// been closed. Mid-write admission failures surface it through
/// `io::Error::other`, so it stays downcastable either way.
#[derive(Debug, Clone, Copy, Error)]
#[error("connection is closed")]
pub struct ConnClosedError;

/// Shared shaping state for one connection.
///
/// The policer's registry and the [`PolicedConn`] hold the same
/// `Arc<ConnShaper>`: setters mutate it from the policer side, the write
/// path snapshots it once per chunk. The limiter is replaced wholesale on
/// every reconfiguration; the slot's lock is held only to clone or swap the
/// `Arc`, never across a reservation.
#[derive(Debug)]
pub(crate) struct ConnShaper {
    rate: AtomicU64,
    max_chunk: AtomicU64,
    chunk_size: AtomicU64,
    limiter: Mutex<Arc<RateLimiter>>,
    burst_factor: Weak<BurstFactor>,
}

impl ConnShaper {
    pub(crate) fn new(rate: u64, max_chunk: u64, burst_factor: Weak<BurstFactor>) -> Self {
        let shaper = Self {
            rate: AtomicU64::new(rate),
            max_chunk: AtomicU64::new(0),
            chunk_size: AtomicU64::new(0),
            limiter: Mutex::new(Arc::new(RateLimiter::new(0, 0))),
            burst_factor,
        };
        shaper.calc_chunk(max_chunk);
        shaper
    }

    pub(crate) fn rate(&self) -> u64 {
        self.rate.load(Ordering::Acquire)
    }

    pub(crate) fn max_chunk(&self) -> u64 {
        self.max_chunk.load(Ordering::Acquire)
    }

    pub(crate) fn chunk_size(&self) -> u64 {
        self.chunk_size.load(Ordering::Acquire)
    }

    /// Snapshot of the current limiter; the returned object stays valid even
    /// if a setter swaps in a replacement mid-chunk.
    pub(crate) fn limiter(&self) -> Arc<RateLimiter> {
        self.limiter.lock().expect("poisoned lock").clone()
    }

    fn factor(&self) -> f64 {
        self.burst_factor
            .upgrade()
            .map(|f| f.get())
            .unwrap_or(DEFAULT_BURST_FACTOR)
    }

    /// Installs a new rate and re-derives the chunk size and limiter.
    pub(crate) fn set_rate(&self, rate: u64, max_chunk: u64) {
        self.rate.store(rate, Ordering::Release);
        self.calc_chunk(max_chunk);
    }

    /// Recomputes the admission chunk for the given global window and
    /// rebuilds the limiter so its depth tracks the chunk.
    ///
    /// With no per-connection ceiling the chunk is the global window itself;
    /// otherwise it is this connection's own burst allowance, never exceeding
    /// the global window while one exists.
    pub(crate) fn calc_chunk(&self, max_chunk: u64) {
        self.max_chunk.store(max_chunk, Ordering::Release);
        let rate = self.rate();
        let chunk = if rate == 0 {
            max_chunk
        } else {
            let own = burst_bytes(rate, self.factor());
            if max_chunk > 0 {
                own.min(max_chunk)
            } else {
                own
            }
        };
        self.chunk_size.store(chunk, Ordering::Release);
        *self.limiter.lock().expect("poisoned lock") = Arc::new(RateLimiter::new(rate, chunk));
        trace!(rate, chunk, "connection shaping recomputed");
    }
}

enum Phase {
    /// Between chunks: nothing announced.
    Idle,
    /// Chunk announced; waiting for the admission task's permit.
    Waiting {
        take: usize,
        permit: oneshot::Receiver<()>,
    },
    /// Globally admitted; sleeping off this connection's own delay.
    Throttling { take: usize },
    /// Both ceilings cleared; forward the chunk to the transport.
    Writing { take: usize },
}

/// A bandwidth-policed connection produced by
/// [`Policer::wrap`](crate::policer::Policer::wrap).
///
/// Implements [`AsyncRead`] (pass-through) and [`AsyncWrite`] (shaped).
/// Closing — or dropping — the wrapper stops its admission task and removes
/// it from the policer's registry.
#[pin_project(PinnedDrop)]
pub struct PolicedConn<T> {
    #[pin]
    inner: T,
    peer: SocketAddr,
    shaper: Arc<ConnShaper>,
    sizes: Option<mpsc::Sender<AdmitRequest>>,
    core: Weak<Core>,
    sleep: Pin<Box<Sleep>>,
    phase: Phase,
    closed: bool,
}

impl<T> PolicedConn<T> {
    pub(crate) fn new(
        inner: T,
        peer: SocketAddr,
        shaper: Arc<ConnShaper>,
        sizes: mpsc::Sender<AdmitRequest>,
        core: Weak<Core>,
    ) -> Self {
        Self {
            inner,
            peer,
            shaper,
            sizes: Some(sizes),
            core,
            sleep: Box::pin(sleep(Duration::ZERO)),
            phase: Phase::Idle,
            closed: false,
        }
    }

    /// The peer address captured when the connection was accepted; also its
    /// key in the policer's registry.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Sets this connection's individual ceiling in **kilobytes per second**.
    ///
    /// `0` removes the per-connection ceiling; the global one still applies.
    /// The chunk size and bucket depth are re-derived from the shared burst
    /// factor, the same way policer-driven updates are.
    pub fn set_rate(&self, kbps: u64) {
        self.shaper
            .set_rate(kbps.saturating_mul(1024), self.shaper.max_chunk());
    }

    /// Shared reference to the wrapped transport.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutable reference to the wrapped transport.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: AsyncWrite + Unpin> PolicedConn<T> {
    /// Tears down shaping and shuts the transport down.
    ///
    /// The first call drops the admission channel (letting the policer-side
    /// task exit), deregisters the connection, and returns the transport's
    /// shutdown result. Every later call returns
    /// `io::Error::other(`[`ConnClosedError`]`)`. Shutting the wrapper down
    /// through [`AsyncWrite`] counts as closing it too.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::other(ConnClosedError));
        }
        self.closed = true;
        teardown(&mut self.sizes, &self.core, &self.shaper, self.peer);
        self.inner.shutdown().await
    }
}

/// Idempotent: drops the admission sender (the worker drains and exits) and
/// removes the registry entry, once.
fn teardown(
    sizes: &mut Option<mpsc::Sender<AdmitRequest>>,
    core: &Weak<Core>,
    shaper: &Arc<ConnShaper>,
    peer: SocketAddr,
) {
    if sizes.take().is_some() {
        if let Some(core) = core.upgrade() {
            core.deregister(peer, shaper);
        }
        trace!(%peer, "connection shaping torn down");
    }
}

#[pinned_drop]
impl<T> PinnedDrop for PolicedConn<T> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        teardown(this.sizes, this.core, this.shaper, *this.peer);
    }
}

impl<T: AsyncWrite> AsyncWrite for PolicedConn<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.as_mut().project();

        loop {
            match this.phase {
                Phase::Idle => {
                    let sender = match this.sizes.as_ref() {
                        Some(sender) if !*this.closed && !buf.is_empty() => sender,
                        // Closed, torn down, or empty buffer: the transport
                        // decides.
                        _ => return this.inner.as_mut().poll_write(cx, buf),
                    };

                    let chunk = this.shaper.chunk_size();
                    let rate = this.shaper.rate();
                    if chunk == 0 && rate == 0 {
                        // No ceiling anywhere: one unbounded write.
                        return this.inner.as_mut().poll_write(cx, buf);
                    }

                    let take = chunk.max(1).min(buf.len() as u64) as usize;
                    let (tx, rx) = oneshot::channel();
                    if sender
                        .try_send(AdmitRequest {
                            size: take as u64,
                            permit: tx,
                        })
                        .is_err()
                    {
                        return Poll::Ready(Err(io::Error::other(ConnClosedError)));
                    }
                    *this.phase = Phase::Waiting { take, permit: rx };
                }
                Phase::Waiting { take, permit } => {
                    let take = *take;
                    if ready!(permit.poll_unpin(cx)).is_err() {
                        *this.phase = Phase::Idle;
                        return Poll::Ready(Err(io::Error::other(ConnClosedError)));
                    }
                    let limiter = this.shaper.limiter();
                    let now = Instant::now();
                    let delay = limiter.reserve(now, take as u64);
                    if delay.is_zero() {
                        *this.phase = Phase::Writing { take };
                    } else {
                        this.sleep.as_mut().reset(now + delay);
                        *this.phase = Phase::Throttling { take };
                    }
                }
                Phase::Throttling { take } => {
                    let take = *take;
                    ready!(this.sleep.poll_unpin(cx));
                    *this.phase = Phase::Writing { take };
                }
                Phase::Writing { take } => {
                    let take = (*take).min(buf.len());
                    let res = ready!(this.inner.as_mut().poll_write(cx, &buf[..take]));
                    *this.phase = Phase::Idle;
                    return Poll::Ready(res);
                }
            }
        }
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.as_mut().project();

        loop {
            match this.phase {
                Phase::Idle => {
                    let total: usize = bufs.iter().map(|b| b.len()).sum();
                    let sender = match this.sizes.as_ref() {
                        Some(sender) if !*this.closed && total > 0 => sender,
                        _ => return this.inner.as_mut().poll_write_vectored(cx, bufs),
                    };

                    let chunk = this.shaper.chunk_size();
                    let rate = this.shaper.rate();
                    if chunk == 0 && rate == 0 {
                        return this.inner.as_mut().poll_write_vectored(cx, bufs);
                    }

                    let take = chunk.max(1).min(total as u64) as usize;
                    let (tx, rx) = oneshot::channel();
                    if sender
                        .try_send(AdmitRequest {
                            size: take as u64,
                            permit: tx,
                        })
                        .is_err()
                    {
                        return Poll::Ready(Err(io::Error::other(ConnClosedError)));
                    }
                    *this.phase = Phase::Waiting { take, permit: rx };
                }
                Phase::Waiting { take, permit } => {
                    let take = *take;
                    if ready!(permit.poll_unpin(cx)).is_err() {
                        *this.phase = Phase::Idle;
                        return Poll::Ready(Err(io::Error::other(ConnClosedError)));
                    }
                    let limiter = this.shaper.limiter();
                    let now = Instant::now();
                    let delay = limiter.reserve(now, take as u64);
                    if delay.is_zero() {
                        *this.phase = Phase::Writing { take };
                    } else {
                        this.sleep.as_mut().reset(now + delay);
                        *this.phase = Phase::Throttling { take };
                    }
                }
                Phase::Throttling { take } => {
                    let take = *take;
                    ready!(this.sleep.poll_unpin(cx));
                    *this.phase = Phase::Writing { take };
                }
                Phase::Writing { take } => {
                    // Build a view limited to the admitted chunk, inline in
                    // the common case.
                    let mut remaining = *take;
                    let mut limited: SmallVec<[io::IoSlice<'_>; INLINE_IOVEC]> = SmallVec::new();
                    for s in bufs {
                        if remaining == 0 {
                            break;
                        }
                        let n = s.len().min(remaining);
                        limited.push(io::IoSlice::new(&s[..n]));
                        remaining -= n;
                    }
                    let res = ready!(this.inner.as_mut().poll_write_vectored(cx, &limited));
                    *this.phase = Phase::Idle;
                    return Poll::Ready(res);
                }
            }
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        // A trait-level shutdown is a close: without the flag, a later
        // `close()` would report success instead of `ConnClosedError`.
        *this.closed = true;
        teardown(this.sizes, this.core, this.shaper, *this.peer);
        this.inner.poll_shutdown(cx)
    }
}

impl<T: AsyncRead> AsyncRead for PolicedConn<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<T: AsyncBufRead> AsyncBufRead for PolicedConn<T> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        self.project().inner.poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        self.project().inner.consume(amt)
    }
}

impl<T: fmt::Debug> fmt::Debug for PolicedConn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

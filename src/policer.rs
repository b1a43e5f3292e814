//! The process-wide bandwidth controller.
//!
//! A [`Policer`] owns the server-wide token bucket, the default
//! per-connection rate, the shared burst factor, and a registry of every
//! live [`PolicedConn`]. Wrapping pairs directly with an accept loop:
//!
//! ```no_run
//! use tokio::net::TcpListener;
//! use tokio_policer::Policer;
//!
//! # #[tokio::main]
//! # async fn main() -> std::io::Result<()> {
//! // 10 MB/s across the server, 2 MB/s per connection.
//! let policer = Policer::new(10 * 1024, 2 * 1024);
//! let listener = TcpListener::bind("0.0.0.0:8080").await?;
//! loop {
//!     let mut conn = policer.wrap(listener.accept().await)?;
//!     tokio::spawn(async move {
//!         // serve `conn` like any AsyncRead + AsyncWrite stream
//!         use tokio::io::AsyncWriteExt;
//!         let _ = conn.write_all(b"hello").await;
//!         let _ = conn.close().await;
//!     });
//! }
//! # }
//! ```
//!
//! Every rate setter takes **kilobytes per second** and `0` means unlimited.
//! Changes apply to all live connections before the setter returns; traffic
//! in flight is never interrupted, at worst one already-announced chunk still
//! uses the previous configuration.
//!
//! ## Admission
//!
//! Each wrapped connection gets a dedicated admission task. The connection
//! announces the size of its next chunk; the task reserves that many bytes
//! on the global bucket, sleeps off the returned delay, and hands back a
//! permit. One reservation per in-flight chunk keeps the global bucket from
//! becoming a lock every writer contends on, and the single-slot handoff
//! makes admission strictly FIFO within a connection.
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use ahash::RandomState;
use dashmap::DashMap;
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep, Instant},
};
use tracing::{debug, trace};

use crate::{
    burst::{burst_bytes, BurstFactor, BurstFactorError},
    conn::{ConnShaper, PolicedConn},
    limiter::RateLimiter,
};

/// One chunk's admission request: the announced size and the slot the
/// permit is delivered through.
pub(crate) struct AdmitRequest {
    pub(crate) size: u64,
    pub(crate) permit: oneshot::Sender<()>,
}

/// Shared controller state; connections hold it weakly for deregistration.
pub(crate) struct Core {
    global_rate: AtomicU64,
    conn_rate: AtomicU64,
    max_chunk: AtomicU64,
    burst_factor: Arc<BurstFactor>,
    global_limiter: Mutex<Arc<RateLimiter>>,
    connections: DashMap<SocketAddr, Arc<ConnShaper>, RandomState>,
}

impl Core {
    /// Snapshot of the current global limiter.
    fn global_limiter(&self) -> Arc<RateLimiter> {
        self.global_limiter.lock().expect("poisoned lock").clone()
    }

    /// Recomputes the global admission window, swaps the global limiter, and
    /// pushes the new window to every registered connection.
    fn apply_global(&self, rate: u64, factor: f64) {
        let max_chunk = if rate > 0 { burst_bytes(rate, factor) } else { 0 };
        self.max_chunk.store(max_chunk, Ordering::Release);
        *self.global_limiter.lock().expect("poisoned lock") =
            Arc::new(RateLimiter::new(rate, max_chunk));
        for entry in self.connections.iter() {
            entry.value().calc_chunk(max_chunk);
        }
        debug!(rate, max_chunk, "global shaping applied");
    }

    /// Removes `peer` from the registry, but only while it still maps to
    /// `shaper` — a reconnect from the same address must not be evicted by
    /// its displaced predecessor closing late.
    pub(crate) fn deregister(&self, peer: SocketAddr, shaper: &Arc<ConnShaper>) {
        self.connections
            .remove_if(&peer, |_, registered| Arc::ptr_eq(registered, shaper));
    }
}

/// Hierarchical bandwidth shaper: one global ceiling shared by all wrapped
/// connections plus an individual ceiling per connection.
///
/// Cheap to clone; all clones drive the same state.
#[derive(Clone)]
pub struct Policer {
    core: Arc<Core>,
}

impl Policer {
    /// Creates a policer with the given global and per-connection rates in
    /// **kilobytes per second** (`0` = unlimited).
    ///
    /// If the global rate is positive but below the per-connection rate, it
    /// is silently raised to match.
    pub fn new(global_kbps: u64, conn_kbps: u64) -> Self {
        let core = Arc::new(Core {
            global_rate: AtomicU64::new(0),
            conn_rate: AtomicU64::new(conn_kbps.saturating_mul(1024)),
            max_chunk: AtomicU64::new(0),
            burst_factor: Arc::new(BurstFactor::default()),
            global_limiter: Mutex::new(Arc::new(RateLimiter::new(0, 0))),
            connections: DashMap::with_hasher(RandomState::new()),
        });
        let policer = Self { core };
        // Route through the setter so derived state is initialized on the
        // same path later mutations take.
        policer.set_global_rate(global_kbps);
        policer
    }

    /// Sets the server-wide rate in **kilobytes per second**; `0` removes
    /// the global ceiling.
    ///
    /// A positive value below the current per-connection rate is raised to
    /// match it. The global limiter is rebuilt and every live connection's
    /// chunk size is updated before this returns.
    pub fn set_global_rate(&self, kbps: u64) {
        let mut rate = kbps.saturating_mul(1024);
        let conn_rate = self.core.conn_rate.load(Ordering::Acquire);
        if rate > 0 && rate < conn_rate {
            debug!(requested = rate, clamped = conn_rate, "global rate below per-connection rate");
            rate = conn_rate;
        }
        self.core.global_rate.store(rate, Ordering::Release);
        self.core.apply_global(rate, self.core.burst_factor.get());
    }

    /// Sets the per-connection rate in **kilobytes per second** for every
    /// live connection and for connections wrapped later; `0` removes the
    /// per-connection ceiling.
    ///
    /// A value above the current global rate (when one exists) is lowered to
    /// match it.
    pub fn set_conn_rate(&self, kbps: u64) {
        let mut rate = kbps.saturating_mul(1024);
        let global = self.core.global_rate.load(Ordering::Acquire);
        if global > 0 && rate > global {
            debug!(requested = rate, clamped = global, "per-connection rate above global rate");
            rate = global;
        }
        self.core.conn_rate.store(rate, Ordering::Release);
        let max_chunk = self.core.max_chunk.load(Ordering::Acquire);
        for entry in self.core.connections.iter() {
            entry.value().set_rate(rate, max_chunk);
        }
        debug!(rate, "per-connection rate applied");
    }

    /// Sets the shared burst factor (seconds of full-rate traffic allowed as
    /// one burst, `0.001..=1.0`) and reapplies the current global rate so
    /// every bucket depth and chunk size follows.
    pub fn set_burst_factor(&self, factor: f64) -> Result<(), BurstFactorError> {
        self.core.burst_factor.set(factor)?;
        self.core
            .apply_global(self.core.global_rate.load(Ordering::Acquire), factor);
        Ok(())
    }

    /// Wraps an accepted connection, registering it and starting its
    /// admission task.
    ///
    /// Takes the accept result directly so an accept loop reads as
    /// `policer.wrap(listener.accept().await)?`. An `Err` passes through
    /// unchanged: nothing is registered and no task is spawned.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn wrap<T>(&self, accepted: io::Result<(T, SocketAddr)>) -> io::Result<PolicedConn<T>> {
        let (inner, peer) = accepted?;
        let shaper = Arc::new(ConnShaper::new(
            self.core.conn_rate.load(Ordering::Acquire),
            self.core.max_chunk.load(Ordering::Acquire),
            Arc::downgrade(&self.core.burst_factor),
        ));
        // Keyed by peer address: a later wrap from the same address
        // displaces this entry, matching accept-loop reality for TCP.
        self.core.connections.insert(peer, shaper.clone());

        let (sizes, requests) = mpsc::channel(1);
        tokio::spawn(admission(self.core.clone(), requests));
        debug!(%peer, "connection wrapped");

        Ok(PolicedConn::new(
            inner,
            peer,
            shaper,
            sizes,
            Arc::downgrade(&self.core),
        ))
    }

    /// Current global rate in bytes per second (`0` = unlimited).
    pub fn global_rate(&self) -> u64 {
        self.core.global_rate.load(Ordering::Acquire)
    }

    /// Current default per-connection rate in bytes per second
    /// (`0` = unlimited).
    pub fn conn_rate(&self) -> u64 {
        self.core.conn_rate.load(Ordering::Acquire)
    }

    /// Current burst factor.
    pub fn burst_factor(&self) -> f64 {
        self.core.burst_factor.get()
    }

    /// Largest chunk the global ceiling currently admits, in bytes
    /// (`0` while the global rate is unlimited).
    pub fn max_chunk(&self) -> u64 {
        self.core.max_chunk.load(Ordering::Acquire)
    }

    /// Number of live registered connections.
    pub fn connection_count(&self) -> usize {
        self.core.connections.len()
    }
}

/// Per-connection admission worker: one global-bucket reservation per
/// announced chunk. Exits when the connection closes or is dropped.
async fn admission(core: Arc<Core>, mut requests: mpsc::Receiver<AdmitRequest>) {
    while let Some(req) = requests.recv().await {
        let limiter = core.global_limiter();
        if core.global_rate.load(Ordering::Acquire) == 0 {
            let _ = req.permit.send(());
            continue;
        }

        let mut size = req.size;
        let burst = limiter.burst();
        if burst > 0 && burst < size {
            // A freshly swapped limiter may be shallower than the chunk the
            // connection announced before the new chunk size reached it.
            // Reserving more than the bucket holds would never complete;
            // under-reserving once keeps the writer moving.
            trace!(requested = size, burst, "admission clamped to limiter burst");
            size = burst;
        }

        let delay = limiter.reserve(Instant::now(), size);
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let _ = req.permit.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    const KIB: u64 = 1024;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn wrap_duplex(policer: &Policer, port: u16) -> PolicedConn<DuplexStream> {
        let (server, _client) = duplex(64 * 1024);
        policer.wrap(Ok((server, addr(port)))).unwrap()
    }

    fn registered_chunk(policer: &Policer, port: u16) -> u64 {
        policer
            .core
            .connections
            .get(&addr(port))
            .expect("connection not registered")
            .chunk_size()
    }

    #[tokio::test]
    async fn new_initializes_derived_state() {
        let policer = Policer::new(1024, 0);
        assert_eq!(policer.global_rate(), KIB * KIB);
        assert_eq!(policer.conn_rate(), 0);
        assert_eq!(policer.burst_factor(), 0.005);
        // ceil(1 MiB/s * 5 ms)
        assert_eq!(policer.max_chunk(), 5243);
    }

    #[tokio::test]
    async fn zero_global_rate_means_no_window() {
        let policer = Policer::new(0, 512);
        assert_eq!(policer.global_rate(), 0);
        assert_eq!(policer.max_chunk(), 0);
    }

    #[tokio::test]
    async fn global_rate_clamps_up_to_conn_rate() {
        let policer = Policer::new(1024, 4096);
        // 1 MB/s global would undercut the 4 MB/s per-connection rate.
        assert_eq!(policer.global_rate(), 4096 * KIB);
        assert_eq!(policer.conn_rate(), 4096 * KIB);
    }

    #[tokio::test]
    async fn conn_rate_clamps_down_to_global_rate() {
        let policer = Policer::new(2048, 0);
        policer.set_conn_rate(4096);
        assert_eq!(policer.conn_rate(), 2048 * KIB);

        // Without a global ceiling nothing clamps.
        policer.set_global_rate(0);
        policer.set_conn_rate(4096);
        assert_eq!(policer.conn_rate(), 4096 * KIB);
    }

    #[tokio::test]
    async fn burst_factor_rejection_changes_nothing() {
        let policer = Policer::new(1024, 0);
        let max_chunk = policer.max_chunk();

        assert!(policer.set_burst_factor(7.5).is_err());
        assert_eq!(policer.burst_factor(), 0.005);
        assert_eq!(policer.max_chunk(), max_chunk);
    }

    #[tokio::test]
    async fn burst_factor_reshapes_global_window() {
        let policer = Policer::new(1024, 0);
        policer.set_burst_factor(0.5).unwrap();
        assert_eq!(policer.max_chunk(), 512 * KIB);
    }

    #[tokio::test]
    async fn setters_propagate_to_live_connections() {
        let policer = Policer::new(0, 0);
        let _conn = wrap_duplex(&policer, 4001);
        assert_eq!(registered_chunk(&policer, 4001), 0);

        // Global ceiling appears: the unlimited connection chunks by the
        // global window.
        policer.set_global_rate(2048);
        assert_eq!(registered_chunk(&policer, 4001), policer.max_chunk());

        // Per-connection ceiling appears: chunks shrink to the connection's
        // own burst allowance.
        policer.set_conn_rate(1024);
        assert_eq!(registered_chunk(&policer, 4001), 5243);

        // A wider burst factor regrows both.
        policer.set_burst_factor(0.1).unwrap();
        assert_eq!(registered_chunk(&policer, 4001), 104_858);
    }

    #[tokio::test]
    async fn new_connections_inherit_current_defaults() {
        let policer = Policer::new(4096, 1024);
        let conn = wrap_duplex(&policer, 4002);
        assert_eq!(conn.peer_addr(), addr(4002));
        assert_eq!(registered_chunk(&policer, 4002), 5243);
    }

    #[tokio::test]
    async fn wrap_passes_accept_errors_through() {
        let policer = Policer::new(1024, 0);
        let err = policer
            .wrap::<DuplexStream>(Err(io::Error::other("accept failed")))
            .unwrap_err();
        assert_eq!(err.to_string(), "accept failed");
        assert_eq!(policer.connection_count(), 0);
    }

    #[tokio::test]
    async fn close_and_drop_both_deregister() {
        let policer = Policer::new(1024, 0);
        let mut closing = wrap_duplex(&policer, 4003);
        let dropping = wrap_duplex(&policer, 4004);
        assert_eq!(policer.connection_count(), 2);

        closing.close().await.unwrap();
        assert_eq!(policer.connection_count(), 1);

        drop(dropping);
        assert_eq!(policer.connection_count(), 0);
    }

    #[tokio::test]
    async fn displaced_connection_cannot_evict_its_successor() {
        let policer = Policer::new(1024, 0);
        let first = wrap_duplex(&policer, 4005);
        let _second = wrap_duplex(&policer, 4005);
        assert_eq!(policer.connection_count(), 1);

        // The first wrapper was displaced in the registry; dropping it must
        // leave the second one registered.
        drop(first);
        assert_eq!(policer.connection_count(), 1);
    }
}

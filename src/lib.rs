//! Dual-ceiling bandwidth shaping for Tokio byte streams.
//!
//! `tokio-policer` adds hierarchical egress shaping to any byte-stream
//! server: every wrapped connection is paced against **two** token buckets
//! at once — its own rate and a server-wide rate shared by all connections.
//! Both ceilings, and the burst window that parameterizes them, can be
//! retuned at runtime without interrupting traffic.
//!
//! - [`Policer`] holds the global bucket, the defaults for new connections,
//!   and the registry of live connections; its setters propagate
//!   immediately to everything registered.
//! - [`PolicedConn`] wraps one accepted stream. Writes are split into
//!   chunks sized by the burst window; each chunk is admitted by the global
//!   bucket first and the connection's own bucket second before reaching
//!   the transport. Reads pass through untouched.
//!
//! All public rates are **kilobytes per second** (1 kB = 1024 bytes) and
//! `0` always means *unlimited* — at both levels at once, writes collapse
//! to plain pass-through.
//!
//! ```no_run
//! use tokio::io::AsyncWriteExt;
//! use tokio::net::TcpListener;
//! use tokio_policer::Policer;
//!
//! # #[tokio::main]
//! # async fn main() -> std::io::Result<()> {
//! // 100 MB/s for the whole server, 10 MB/s per client.
//! let policer = Policer::new(100 * 1024, 10 * 1024);
//! let listener = TcpListener::bind("0.0.0.0:8080").await?;
//! loop {
//!     let mut conn = policer.wrap(listener.accept().await)?;
//!     let policer = policer.clone();
//!     tokio::spawn(async move {
//!         // Tighten the whole server on the fly, or just this client:
//!         policer.set_global_rate(50 * 1024);
//!         conn.set_rate(1024);
//!         let _ = conn.write_all(b"shaped response").await;
//!         let _ = conn.close().await;
//!     });
//! }
//! # }
//! ```
//!
//! Shaping is egress-only and process-local: no read-side pacing, no
//! fairness guarantees beyond first-come reservation on the shared bucket,
//! and no coordination across processes.
pub mod burst;
pub mod conn;
pub mod limiter;
pub mod meter;
pub mod policer;

pub use burst::{BurstFactor, BurstFactorError, DEFAULT_BURST_FACTOR};
pub use conn::{ConnClosedError, PolicedConn};
pub use limiter::RateLimiter;
pub use meter::MeteredReader;
pub use policer::Policer;

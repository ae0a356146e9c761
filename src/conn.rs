//! Rate-limited connection wrapper.
//!
//! Every read and write is split into chunks sized against the current
//! limiter configuration; each chunk first claims tokens from the
//! per-connection limiter, then from the listener-wide one, and only then
//! touches the underlying stream. Limit changes made through the listener
//! are picked up at the next chunk boundary.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;

use crate::error::QosError;
use crate::limiter::RateLimiter;
use crate::listener::ListenerShared;

/// Size one chunk of I/O.
///
/// The chunk starts at the remaining request size and is shrunk so that a
/// single wait never claims more than a small fraction of either bucket:
/// large claims would starve sibling connections sharing the global limiter
/// and would delay the effect of a limit change until the claim completed.
/// Returns 0 when either limiter is in the blocked configuration (finite
/// rate with zero burst); any throttled result is raised to at least one
/// byte so progress is possible.
pub(crate) fn chunk_size(
    per_conn: &RateLimiter,
    global: &RateLimiter,
    remaining: usize,
    divisor: u64,
) -> usize {
    let mut chunk = remaining;

    let (rate, burst) = per_conn.config();
    if rate.is_finite() {
        if burst == 0 {
            return 0;
        }
        if chunk as u64 > burst {
            chunk = (burst / divisor) as usize;
        }
    }

    let (rate, burst) = global.config();
    if rate.is_finite() {
        if burst == 0 {
            return 0;
        }
        let fraction = (burst / divisor) as usize;
        if chunk > fraction {
            chunk = fraction;
        }
    }

    chunk.max(1)
}

/// State shared between a connection and its split halves.
pub(crate) struct ConnState {
    pub(crate) listener: Arc<ListenerShared>,
    /// Limiter owned by this connection; both directions draw from it.
    pub(crate) limiter: RateLimiter,
    /// Bandwidth the limiter was last configured with, compared against the
    /// listener's current value at every chunk boundary.
    pub(crate) observed_bandwidth: AtomicI32,
    /// Close signal; flipping it aborts every wait on this connection.
    cancel: watch::Sender<bool>,
    peer_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
}

impl ConnState {
    fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Prepare one chunk: detect a changed per-connection limit, size the
    /// chunk, and claim tokens from both limiters. Restarts from scratch if
    /// the listener limits change mid-wait, and fails with
    /// [`QosError::Cancelled`] once the connection is closed.
    async fn acquire(
        &self,
        remaining: usize,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<usize, QosError> {
        loop {
            if *cancel.borrow() {
                return Err(QosError::Cancelled);
            }

            // Arm the limits-changed wake-up before reading the current
            // limits, so an update landing in between is not missed.
            let limits_changed = self.listener.limits_changed.notified();
            tokio::pin!(limits_changed);
            limits_changed.as_mut().enable();

            let target = self.listener.pc_bandwidth.load(Ordering::Relaxed);
            if self.observed_bandwidth.load(Ordering::Relaxed) != target {
                self.limiter.set_bandwidth(target);
                self.observed_bandwidth.store(target, Ordering::Relaxed);
                tracing::trace!(bandwidth = target, "per-connection limit reconfigured");
            }

            let chunk = chunk_size(
                &self.limiter,
                &self.listener.global,
                remaining,
                self.listener.chunk_divisor,
            );
            // In a blocked configuration the single token below is never
            // granted; the task parks here until the limits change or the
            // connection is closed.
            let want = chunk.max(1);

            tokio::select! {
                _ = async {
                    self.limiter.wait_n(want as u64).await;
                    self.listener.global.wait_n(want as u64).await;
                } => return Ok(want),
                _ = &mut limits_changed => continue,
                _ = cancel.changed() => return Err(QosError::Cancelled),
            }
        }
    }
}

impl Drop for ConnState {
    fn drop(&mut self) {
        self.listener.metrics.active_connections.dec();
    }
}

async fn limited_read<S>(
    state: &ConnState,
    cancel: &mut watch::Receiver<bool>,
    io: &mut S,
    buf: &mut [u8],
) -> Result<usize, QosError>
where
    S: AsyncRead + Unpin,
{
    let mut processed = 0;
    while processed < buf.len() {
        let chunk = state.acquire(buf.len() - processed, cancel).await?;
        let mut scratch = vec![0u8; chunk];
        let n = tokio::select! {
            res = io.read(&mut scratch) => res?,
            _ = cancel.changed() => return Err(QosError::Cancelled),
        };
        if n == 0 {
            break;
        }
        buf[processed..processed + n].copy_from_slice(&scratch[..n]);
        processed += n;
        state.listener.metrics.bytes_read.inc_by(n as u64);
    }
    Ok(processed)
}

async fn limited_write<S>(
    state: &ConnState,
    cancel: &mut watch::Receiver<bool>,
    io: &mut S,
    buf: &[u8],
) -> Result<usize, QosError>
where
    S: AsyncWrite + Unpin,
{
    let mut processed = 0;
    while processed < buf.len() {
        let chunk = state.acquire(buf.len() - processed, cancel).await?;
        tokio::select! {
            res = io.write_all(&buf[processed..processed + chunk]) => res?,
            _ = cancel.changed() => return Err(QosError::Cancelled),
        }
        processed += chunk;
        state.listener.metrics.bytes_written.inc_by(chunk as u64);
    }
    Ok(processed)
}

/// A connection accepted through a [`QosListener`](crate::QosListener).
///
/// Reads and writes are paced by the per-connection and listener-wide
/// limiters. `read` fills the whole buffer unless the peer closes first;
/// `write` sends the whole buffer. Use [`QosConn::into_split`] to drive the
/// two directions from different tasks.
pub struct QosConn<S> {
    stream: S,
    pub(crate) state: Arc<ConnState>,
    cancel: watch::Receiver<bool>,
}

impl<S> QosConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        stream: S,
        peer_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
        listener: Arc<ListenerShared>,
        bandwidth: i32,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        listener.metrics.active_connections.inc();
        let state = Arc::new(ConnState {
            listener,
            limiter: RateLimiter::for_bandwidth(bandwidth),
            observed_bandwidth: AtomicI32::new(bandwidth),
            cancel: cancel_tx,
            peer_addr,
            local_addr,
        });
        Self {
            stream,
            state,
            cancel: cancel_rx,
        }
    }

    /// Read into `buf`, pacing every chunk against both limiters.
    ///
    /// Keeps reading until the buffer is full or the peer closes; returns
    /// the bytes transferred (0 on a closed stream).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, QosError> {
        limited_read(&self.state, &mut self.cancel, &mut self.stream, buf).await
    }

    /// Write all of `buf`, pacing every chunk against both limiters.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, QosError> {
        limited_write(&self.state, &mut self.cancel, &mut self.stream, buf).await
    }

    /// Close the connection: abort every in-flight or future wait on it and
    /// shut down the write side of the underlying stream.
    pub async fn close(&mut self) -> Result<(), QosError> {
        self.state.cancel();
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Address of the remote peer, captured at accept time.
    pub fn peer_addr(&self) -> SocketAddr {
        self.state.peer_addr
    }

    /// Local address of the listener this connection came through.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.local_addr
    }

    /// Split into independently usable read and write halves sharing the
    /// same per-connection limiter and close signal.
    pub fn into_split(self) -> (QosReadHalf<S>, QosWriteHalf<S>) {
        let (read, write) = split(self.stream);
        (
            QosReadHalf {
                io: read,
                state: self.state.clone(),
                cancel: self.cancel.clone(),
            },
            QosWriteHalf {
                io: write,
                state: self.state,
                cancel: self.cancel,
            },
        )
    }
}

/// Read half of a split [`QosConn`].
pub struct QosReadHalf<S> {
    io: ReadHalf<S>,
    state: Arc<ConnState>,
    cancel: watch::Receiver<bool>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> QosReadHalf<S> {
    /// See [`QosConn::read`].
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, QosError> {
        limited_read(&self.state, &mut self.cancel, &mut self.io, buf).await
    }

    /// Abort every wait on this connection, including one parked in the
    /// write half.
    pub fn close(&self) {
        self.state.cancel();
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.state.peer_addr
    }
}

/// Write half of a split [`QosConn`].
pub struct QosWriteHalf<S> {
    io: WriteHalf<S>,
    state: Arc<ConnState>,
    cancel: watch::Receiver<bool>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> QosWriteHalf<S> {
    /// See [`QosConn::write`].
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, QosError> {
        limited_write(&self.state, &mut self.cancel, &mut self.io, buf).await
    }

    /// Close the connection: abort every wait on it (including the read
    /// half) and shut down the write side of the underlying stream.
    pub async fn close(&mut self) -> Result<(), QosError> {
        self.state.cancel();
        self.io.shutdown().await?;
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.state.peer_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ListenerShared;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};
    use tokio::time::{sleep, timeout, Instant};

    fn test_addr() -> SocketAddr {
        "127.0.0.1:4040".parse().unwrap()
    }

    fn shared(global_bps: i32, per_conn_bps: i32) -> Arc<ListenerShared> {
        let shared = Arc::new(ListenerShared::new(&crate::QosConfig::default()));
        shared.global.set_bandwidth(global_bps);
        shared.pc_bandwidth.store(per_conn_bps, Ordering::Relaxed);
        shared
    }

    fn conn_pair(shared: &Arc<ListenerShared>) -> (QosConn<DuplexStream>, DuplexStream) {
        let (local, remote) = duplex(64 * 1024);
        let bandwidth = shared.pc_bandwidth.load(Ordering::Relaxed);
        let conn = QosConn::new(local, test_addr(), None, shared.clone(), bandwidth);
        (conn, remote)
    }

    /// Drain the remote end so writes through the wrapper never stall on
    /// duplex backpressure.
    fn drain(mut remote: DuplexStream) {
        tokio::spawn(async move {
            let mut sink = vec![0u8; 16 * 1024];
            while let Ok(n) = remote.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
        });
    }

    // ── chunk sizing ────────────────────────────────────────────────────

    #[test]
    fn chunk_passes_through_when_unlimited() {
        let pc = RateLimiter::unlimited();
        let global = RateLimiter::unlimited();
        assert_eq!(chunk_size(&pc, &global, 32 * 1024, 10_000), 32 * 1024);
    }

    #[test]
    fn chunk_is_zero_when_per_conn_blocked() {
        let pc = RateLimiter::for_bandwidth(0);
        let global = RateLimiter::unlimited();
        assert_eq!(chunk_size(&pc, &global, 1024, 10_000), 0);
    }

    #[test]
    fn chunk_is_zero_when_global_blocked() {
        let pc = RateLimiter::unlimited();
        let global = RateLimiter::for_bandwidth(0);
        assert_eq!(chunk_size(&pc, &global, 1024, 10_000), 0);
    }

    #[test]
    fn chunk_shrinks_to_per_conn_fraction_for_large_requests() {
        let pc = RateLimiter::for_bandwidth(1_000_000);
        let global = RateLimiter::unlimited();
        // Request below the burst passes through untouched.
        assert_eq!(chunk_size(&pc, &global, 1024, 10_000), 1024);
        // Request above the burst shrinks to burst/divisor.
        assert_eq!(chunk_size(&pc, &global, 2_000_000, 10_000), 100);
    }

    #[test]
    fn chunk_capped_by_global_fraction() {
        let pc = RateLimiter::unlimited();
        let global = RateLimiter::for_bandwidth(1_000_000);
        assert_eq!(chunk_size(&pc, &global, 32 * 1024, 10_000), 100);
    }

    #[test]
    fn tiny_burst_still_makes_progress() {
        let pc = RateLimiter::for_bandwidth(512);
        let global = RateLimiter::for_bandwidth(512);
        // 512 / 10_000 rounds to zero; raised to a single byte.
        assert_eq!(chunk_size(&pc, &global, 4096, 10_000), 1);
    }

    // ── shaping behaviour ───────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn write_is_paced_by_per_conn_limit() {
        let shared = shared(ALLOW_ALL, 1000);
        let (mut conn, remote) = conn_pair(&shared);
        drain(remote);

        // 3000 bytes at 1000 B/s: the initial burst covers 1000, the
        // remaining 2000 take ~2s.
        let start = Instant::now();
        let n = conn.write(&[0x42u8; 3000]).await.unwrap();
        assert_eq!(n, 3000);
        let secs = start.elapsed().as_secs_f64();
        assert!((1.8..=2.3).contains(&secs), "took {secs:.3}s, expected ~2s");
    }

    #[tokio::test(start_paused = true)]
    async fn read_is_paced_and_fills_buffer() {
        let shared = shared(ALLOW_ALL, 1000);
        let (mut conn, mut remote) = conn_pair(&shared);

        tokio::spawn(async move {
            remote.write_all(&[0x17u8; 3000]).await.unwrap();
            remote.shutdown().await.unwrap();
        });

        let start = Instant::now();
        let mut buf = [0u8; 3000];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 3000);
        assert!(buf.iter().all(|&b| b == 0x17));
        let secs = start.elapsed().as_secs_f64();
        assert!((1.8..=2.3).contains(&secs), "took {secs:.3}s, expected ~2s");

        // Stream closed: the next read reports end-of-stream.
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn read_returns_partial_buffer_on_eof() {
        let shared = shared(ALLOW_ALL, ALLOW_ALL);
        let (mut conn, mut remote) = conn_pair(&shared);

        remote.write_all(&[9u8; 1000]).await.unwrap();
        remote.shutdown().await.unwrap();

        let mut buf = [0u8; 4096];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_buffer_is_a_no_op() {
        let shared = shared(ALLOW_ALL, 0);
        let (mut conn, _remote) = conn_pair(&shared);
        assert_eq!(conn.write(&[]).await.unwrap(), 0);
        let mut buf = [0u8; 0];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_connection_makes_no_progress() {
        let shared = shared(2_000_000, 0);
        let (mut conn, remote) = conn_pair(&shared);
        drain(remote);

        let write = conn.write(&[1u8; 128]);
        assert!(
            timeout(Duration::from_secs(30), write).await.is_err(),
            "write completed despite a blocked per-connection limit"
        );
        assert_eq!(shared.metrics.bytes_written.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn raising_limits_unblocks_a_parked_connection() {
        let shared = shared(0, 0);
        let (mut conn, remote) = conn_pair(&shared);
        drain(remote);

        let writer = tokio::spawn(async move { conn.write(&[7u8; 256]).await });

        sleep(Duration::from_secs(2)).await;
        assert!(!writer.is_finished());

        // The same update path QosListener::set_limits takes.
        shared.global.set_bandwidth(8192);
        shared.pc_bandwidth.store(8192, Ordering::Relaxed);
        shared.limits_changed.notify_waiters();

        let n = timeout(Duration::from_secs(10), writer)
            .await
            .expect("write stayed parked after limits were raised")
            .unwrap()
            .unwrap();
        assert_eq!(n, 256);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_change_is_observed_at_chunk_boundary() {
        let shared = shared(ALLOW_ALL, 1024);
        let (mut conn, remote) = conn_pair(&shared);
        drain(remote);

        conn.write(&[0u8; 64]).await.unwrap();
        assert_eq!(conn.state.limiter.config(), (1024.0, 1024));

        shared.pc_bandwidth.store(4096, Ordering::Relaxed);
        shared.limits_changed.notify_waiters();

        conn.write(&[0u8; 64]).await.unwrap();
        assert_eq!(conn.state.limiter.config(), (4096.0, 4096));
        assert_eq!(
            conn.state.observed_bandwidth.load(Ordering::Relaxed),
            4096
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_aborts_a_parked_writer() {
        let shared = shared(2_000_000, 0);
        let (conn, remote) = conn_pair(&shared);
        drain(remote);

        let (read_half, mut write_half) = conn.into_split();
        let writer = tokio::spawn(async move { write_half.write(&[1u8; 64]).await });

        sleep(Duration::from_secs(1)).await;
        read_half.close();

        let res = timeout(Duration::from_secs(5), writer)
            .await
            .expect("writer not woken by close")
            .unwrap();
        assert!(matches!(res, Err(QosError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn split_halves_share_the_per_connection_limiter() {
        let shared = shared(ALLOW_ALL, 1000);
        let (conn, remote) = conn_pair(&shared);
        let (mut read_half, mut write_half) = conn.into_split();

        // Feed the read half up front and drain whatever the write half
        // sends, so only the limiter can slow either direction down.
        let (remote_read, mut remote_write) = split(remote);
        tokio::spawn(async move {
            let mut sink = remote_read;
            let mut buf = vec![0u8; 4096];
            while let Ok(n) = sink.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });
        remote_write.write_all(&[5u8; 500]).await.unwrap();

        // Writing drains the shared bucket; the following read has to wait
        // for refill even though the read half did no I/O yet.
        write_half.write(&[0u8; 1000]).await.unwrap();
        let start = Instant::now();
        let mut buf = [0u8; 500];
        let n = read_half.read(&mut buf).await.unwrap();
        assert_eq!(n, 500);
        let waited = start.elapsed();
        assert!(
            waited >= Duration::from_millis(450),
            "read was granted tokens although the write drained the bucket: {waited:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn data_passes_through_unchanged() {
        let shared = shared(ALLOW_ALL, 8192);
        let (mut conn, mut remote) = conn_pair(&shared);

        let pattern: Vec<u8> = (0..10_240).map(|i| (i % 251) as u8).collect();
        let expected = pattern.clone();

        let collector = tokio::spawn(async move {
            let mut out = Vec::new();
            let mut buf = vec![0u8; 2048];
            loop {
                match remote.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => out.extend_from_slice(&buf[..n]),
                }
            }
            out
        });

        conn.write(&pattern).await.unwrap();
        conn.close().await.unwrap();
        let received = collector.await.unwrap();
        assert_eq!(received, expected);
    }

    const ALLOW_ALL: i32 = crate::limiter::ALLOW_ALL_TRAFFIC;
}

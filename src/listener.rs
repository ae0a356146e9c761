//! Bandwidth-shaping listener wrapper.
//!
//! [`QosListener`] wraps any [`StreamListener`] and hands out
//! [`QosConn`]s whose reads and writes are paced against two limits: a
//! listener-wide ceiling shared by every accepted connection and a
//! per-connection ceiling. Both can be changed at runtime through
//! [`QosListener::set_limits`] and take effect within one chunk of I/O.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;

use crate::config::QosConfig;
use crate::conn::QosConn;
use crate::error::QosError;
use crate::limiter::RateLimiter;
use crate::metrics::QosMetrics;

pub use crate::limiter::ALLOW_ALL_TRAFFIC;

/// A listener producing byte-stream connections.
///
/// Implemented for [`tokio::net::TcpListener`]; test harnesses provide
/// in-memory implementations.
#[async_trait]
pub trait StreamListener: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next inbound connection.
    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;

    /// The address this listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl StreamListener for tokio::net::TcpListener {
    type Stream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)> {
        tokio::net::TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::TcpListener::local_addr(self)
    }
}

/// State shared between the listener and every connection accepted from it.
pub(crate) struct ListenerShared {
    /// Listener-wide limiter, reconfigured in place by `set_limits`.
    pub(crate) global: RateLimiter,
    /// Current per-connection bandwidth; connections compare against their
    /// cached copy at every chunk boundary.
    pub(crate) pc_bandwidth: AtomicI32,
    /// Divisor applied to either burst when sizing a chunk.
    pub(crate) chunk_divisor: u64,
    /// Signalled on every `set_limits`, waking connections parked against a
    /// blocked per-connection limiter so they reconfigure.
    pub(crate) limits_changed: Notify,
    pub(crate) metrics: QosMetrics,
}

impl ListenerShared {
    pub(crate) fn new(config: &QosConfig) -> Self {
        Self {
            global: RateLimiter::for_bandwidth(config.global_bandwidth),
            pc_bandwidth: AtomicI32::new(config.per_connection_bandwidth),
            chunk_divisor: config.chunk_divisor.max(1),
            limits_changed: Notify::new(),
            metrics: QosMetrics::new(),
        }
    }
}

/// Wraps a delegate listener and applies bandwidth shaping to every
/// connection accepted through it.
///
/// A fresh wrapper imposes no limits (both bandwidths are
/// [`ALLOW_ALL_TRAFFIC`]); callers typically follow construction with a
/// [`set_limits`](Self::set_limits) call. Share the wrapper behind an `Arc`
/// to reconfigure limits while an accept loop runs.
pub struct QosListener<L> {
    inner: L,
    shared: Arc<ListenerShared>,
}

impl<L: StreamListener> QosListener<L> {
    /// Wrap `inner` with no limits configured.
    pub fn new(inner: L) -> Self {
        Self::with_config(inner, &QosConfig::default())
    }

    /// Wrap `inner` with limits and chunk divisor taken from `config`.
    pub fn with_config(inner: L, config: &QosConfig) -> Self {
        Self {
            inner,
            shared: Arc::new(ListenerShared::new(config)),
        }
    }

    /// Accept the next connection and wrap it with the current limits.
    /// Errors from the delegate listener are surfaced unchanged.
    pub async fn accept(&self) -> Result<QosConn<L::Stream>, QosError> {
        let (stream, peer_addr) = self.inner.accept().await?;
        self.shared.metrics.connections_accepted.inc();
        tracing::debug!(peer = %peer_addr, "connection accepted");
        let bandwidth = self.shared.pc_bandwidth.load(Ordering::Relaxed);
        Ok(QosConn::new(
            stream,
            peer_addr,
            self.inner.local_addr().ok(),
            Arc::clone(&self.shared),
            bandwidth,
        ))
    }

    /// Install new bandwidth limits.
    ///
    /// `global_bandwidth` caps the aggregate across all connections;
    /// `per_connection_bandwidth` caps each one individually. Values use
    /// the encoding of [`bandwidth_limits`](crate::limiter::bandwidth_limits):
    /// negative is unlimited, zero blocks all traffic. Connections observe
    /// the change at their next chunk boundary.
    pub fn set_limits(&self, global_bandwidth: i32, per_connection_bandwidth: i32) {
        self.shared.global.set_bandwidth(global_bandwidth);
        self.shared
            .pc_bandwidth
            .store(per_connection_bandwidth, Ordering::Relaxed);
        self.shared.limits_changed.notify_waiters();
        tracing::debug!(
            global_bandwidth,
            per_connection_bandwidth,
            "bandwidth limits updated"
        );
    }

    /// The delegate's bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Metrics registry covering accepted connections and shaped bytes.
    pub fn metrics(&self) -> &QosMetrics {
        &self.shared.metrics
    }

    /// Close the delegate listener. Connections already accepted stay
    /// usable: they share only the limiter state, never the delegate.
    pub fn close(self) {
        drop(self.inner);
        tracing::debug!("listener closed");
    }

    /// Unwrap, returning the delegate listener.
    pub fn into_inner(self) -> L {
        self.inner
    }
}

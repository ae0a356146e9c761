//! Bandwidth-shaping wrapper for stream listeners.
//!
//! Wraps any listener that produces byte-stream connections and enforces
//! two independently configurable ceilings on every byte crossing it: an
//! aggregate limit shared by all accepted connections and a per-connection
//! limit. Both are mutable at runtime via [`QosListener::set_limits`] and
//! take effect within one chunk of I/O.

pub mod config;
pub mod conn;
pub mod error;
pub mod limiter;
pub mod listener;
pub mod logging;
pub mod metrics;

pub use config::QosConfig;
pub use conn::{QosConn, QosReadHalf, QosWriteHalf};
pub use error::QosError;
pub use limiter::{bandwidth_limits, RateLimiter, ALLOW_ALL_TRAFFIC};
pub use listener::{QosListener, StreamListener};
pub use logging::{init_logging, LogFormat};
pub use metrics::QosMetrics;

//! Token bucket rate limiter.
//!
//! One token authorizes one byte of transfer. Tokens accrue at a configured
//! rate up to a burst capacity; [`RateLimiter::wait_n`] suspends the calling
//! task until the requested tokens are available. Rate and burst can be
//! changed at runtime; parked waiters re-evaluate under the new values.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Sentinel bandwidth meaning "no limit". Any value at or below this is
/// treated as unlimited.
pub const ALLOW_ALL_TRAFFIC: i32 = -1;

/// Longest single sleep inside a token wait. Waits longer than this loop
/// back through the scheduler so a reconfigured rate is picked up.
const MAX_TOKEN_WAIT_SECS: f64 = 3600.0;

/// Absorbs float rounding in the refill arithmetic, so a wait computed as
/// exactly one token's worth of time is granted after that sleep.
const TOKEN_EPSILON: f64 = 1e-9;

/// Translate a bandwidth value into `(rate, burst)` limiter parameters.
///
/// - `bps <= -1`: unlimited (infinite rate, zero burst).
/// - `bps == 0`: blocked (zero rate, zero burst); no request of one or more
///   tokens can ever be granted.
/// - `bps > 0`: rate and burst both equal to `bps`.
pub fn bandwidth_limits(bps: i32) -> (f64, u64) {
    if bps <= ALLOW_ALL_TRAFFIC {
        (f64::INFINITY, 0)
    } else {
        (bps as f64, bps as u64)
    }
}

/// Token bucket shared by concurrent tasks.
///
/// Accounting lives behind a mutex that is only held for arithmetic, never
/// across a sleep, so hundreds of connections can share one limiter.
pub struct RateLimiter {
    state: Mutex<Bucket>,
    /// Signalled whenever rate or burst changes so parked waiters recheck.
    reconfigured: Notify,
}

struct Bucket {
    /// Tokens per second; `f64::INFINITY` disables rate limiting.
    rate: f64,
    /// Maximum tokens the bucket may hold.
    burst: u64,
    /// Currently available tokens, `0 ≤ tokens ≤ burst`.
    tokens: f64,
    /// Instant of the most recent refill.
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        if self.rate.is_infinite() {
            self.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst as f64);
        self.last_refill = now;
    }
}

/// Outcome of one acquisition attempt under the lock.
enum Grant {
    Ready,
    Wait(Duration),
    /// The request can never be satisfied under the current configuration
    /// (zero rate, or more tokens than the bucket can ever hold).
    Never,
}

impl RateLimiter {
    /// A limiter with the given rate (tokens/sec) and burst capacity.
    /// The bucket starts full.
    pub fn new(rate: f64, burst: u64) -> Self {
        Self {
            state: Mutex::new(Bucket {
                rate,
                burst,
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
            reconfigured: Notify::new(),
        }
    }

    /// A limiter that grants every request immediately.
    pub fn unlimited() -> Self {
        Self::new(f64::INFINITY, 0)
    }

    /// A limiter for the given bandwidth encoding (see [`bandwidth_limits`]).
    pub fn for_bandwidth(bps: i32) -> Self {
        let (rate, burst) = bandwidth_limits(bps);
        Self::new(rate, burst)
    }

    /// Wait until `n` tokens are available and consume them.
    ///
    /// Returns immediately when the rate is infinite or `n` is zero. When
    /// the configuration can never satisfy the request (zero rate, or
    /// `n` larger than the burst) the future stays pending until the limiter
    /// is reconfigured; dropping it abandons the wait without consuming
    /// tokens.
    pub async fn wait_n(&self, n: u64) {
        loop {
            // Register for reconfiguration wake-ups before inspecting state,
            // otherwise an update between the check and the await is lost.
            let reconfigured = self.reconfigured.notified();
            tokio::pin!(reconfigured);
            reconfigured.as_mut().enable();

            let grant = {
                let mut bucket = self.state.lock().expect("limiter lock poisoned");
                bucket.refill(Instant::now());
                if bucket.rate.is_infinite() {
                    Grant::Ready
                } else if n as f64 <= bucket.tokens + TOKEN_EPSILON {
                    bucket.tokens = (bucket.tokens - n as f64).max(0.0);
                    Grant::Ready
                } else if bucket.rate <= 0.0 || n > bucket.burst {
                    Grant::Never
                } else {
                    let deficit = n as f64 - bucket.tokens;
                    let secs = (deficit / bucket.rate).min(MAX_TOKEN_WAIT_SECS);
                    // Clocks below microsecond resolution are not worth
                    // sleeping for; rounding up keeps this loop off the
                    // zero-duration fast path.
                    let delay = Duration::from_secs_f64(secs).max(Duration::from_micros(1));
                    Grant::Wait(delay)
                }
            };

            match grant {
                Grant::Ready => return,
                Grant::Never => reconfigured.await,
                Grant::Wait(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut reconfigured => {}
                    }
                }
            }
        }
    }

    /// Update the rate. Elapsed time is credited at the old rate first.
    pub fn set_rate(&self, rate: f64) {
        {
            let mut bucket = self.state.lock().expect("limiter lock poisoned");
            bucket.refill(Instant::now());
            bucket.rate = rate;
        }
        self.reconfigured.notify_waiters();
    }

    /// Update the burst capacity, clamping stored tokens to the new value.
    pub fn set_burst(&self, burst: u64) {
        {
            let mut bucket = self.state.lock().expect("limiter lock poisoned");
            bucket.refill(Instant::now());
            bucket.burst = burst;
            bucket.tokens = bucket.tokens.min(burst as f64);
        }
        self.reconfigured.notify_waiters();
    }

    /// Update rate and burst in one step, so concurrent waiters never
    /// observe a half-applied pair.
    pub fn set_rate_and_burst(&self, rate: f64, burst: u64) {
        {
            let mut bucket = self.state.lock().expect("limiter lock poisoned");
            bucket.refill(Instant::now());
            bucket.rate = rate;
            bucket.burst = burst;
            bucket.tokens = bucket.tokens.min(burst as f64);
        }
        self.reconfigured.notify_waiters();
    }

    /// Reconfigure from a bandwidth encoding (see [`bandwidth_limits`]).
    pub fn set_bandwidth(&self, bps: i32) {
        let (rate, burst) = bandwidth_limits(bps);
        self.set_rate_and_burst(rate, burst);
    }

    /// The configured rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.state.lock().expect("limiter lock poisoned").rate
    }

    /// The configured burst capacity.
    pub fn burst(&self) -> u64 {
        self.state.lock().expect("limiter lock poisoned").burst
    }

    /// Rate and burst as one consistent snapshot.
    pub fn config(&self) -> (f64, u64) {
        let bucket = self.state.lock().expect("limiter lock poisoned");
        (bucket.rate, bucket.burst)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (rate, burst) = self.config();
        f.debug_struct("RateLimiter")
            .field("rate", &rate)
            .field("burst", &burst)
            .finish()
    }
}

//! Governor-backed admission decision sources.
//!
//! The admission layer only knows the [`Allower`] and [`Waiter`] traits. This
//! module plugs the Governor crate (GCRA, "leaky bucket as a meter") into
//! them so a server can be configured from `RATE_LIMIT_RPS` /
//! `RATE_LIMIT_BURST` without writing an adapter. Any other limiter works
//! just as well through [`AllowerFn`](super::admission::AllowerFn) or
//! [`WaiterFn`](super::admission::WaiterFn).
//!
//! The limiter is global (one bucket for the whole pipeline), which is what
//! the admission layer's "one shared capacity" model expects.

use std::fmt;
use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::admission::{AdmissionError, Allower, WaitFuture, Waiter};

/// Error type for limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// RPS value cannot be zero.
    ZeroRps,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::ZeroRps => {
                write!(
                    f,
                    "RPS must be greater than 0; use ADMISSION_MODE=off for no limiting"
                )
            }
        }
    }
}

impl std::error::Error for RateLimitError {}

/// A single process-wide token bucket usable in either admission mode.
///
/// # Example
///
/// ```rust,ignore
/// let limiter = Arc::new(GovernorLimiter::new(100, 50)?);
/// let rejecting = AdmissionLayer::rejecting(limiter.clone());
/// let delaying = AdmissionLayer::delaying(limiter);
/// ```
pub struct GovernorLimiter {
    limiter: DefaultDirectRateLimiter,
    rps: u32,
    burst: u32,
}

impl GovernorLimiter {
    /// Create a limiter refilling `rps` permits per second with room for
    /// `burst` back-to-back requests (a burst of 0 is treated as 1).
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::ZeroRps` if `rps` is 0.
    pub fn new(rps: u32, burst: u32) -> Result<Self, RateLimitError> {
        let rps_nonzero = NonZeroU32::new(rps).ok_or(RateLimitError::ZeroRps)?;
        let burst_nonzero = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);

        let quota = Quota::per_second(rps_nonzero).allow_burst(burst_nonzero);

        Ok(Self {
            limiter: RateLimiter::direct(quota),
            rps,
            burst: burst_nonzero.get(),
        })
    }

    pub fn rps(&self) -> u32 {
        self.rps
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }
}

impl fmt::Debug for GovernorLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernorLimiter")
            .field("rps", &self.rps)
            .field("burst", &self.burst)
            .finish_non_exhaustive()
    }
}

impl Allower for GovernorLimiter {
    fn allow(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl Waiter for GovernorLimiter {
    fn wait<'a>(&'a self, cancel: &'a CancellationToken) -> WaitFuture<'a> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Rate limiter wait abandoned on cancellation");
                    Err(AdmissionError::Cancelled)
                }
                _ = self.limiter.until_ready() => Ok(()),
            }
        })
    }
}

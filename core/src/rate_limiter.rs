//! Run-wide cap on outbound requests

use std::num::NonZeroU32;

use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use tokio_util::sync::CancellationToken;

/// Token bucket shared by every actor of a run
///
/// One instance lives in the run context; each request attempt takes a
/// permit before it goes out.
pub struct RequestRateLimiter {
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    requests_per_second: Option<f64>,
}

impl RequestRateLimiter {
    /// Create a limiter; `None` or a non-positive rate disables it
    ///
    /// Fractional rates are rounded up to whole requests per second.
    pub fn new(requests_per_second: Option<f64>) -> Self {
        let limiter = requests_per_second
            .filter(|rps| *rps > 0.0)
            .and_then(|rps| NonZeroU32::new((rps.ceil() as u32).max(1)))
            .map(|burst| RateLimiter::direct(Quota::per_second(burst)));

        Self {
            limiter,
            requests_per_second,
        }
    }

    /// A limiter that never waits
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Wait for a permit
    ///
    /// Returns `false` when the run stopped before a permit was granted.
    pub async fn acquire(&self, stop: &CancellationToken) -> bool {
        let Some(limiter) = &self.limiter else {
            return !stop.is_cancelled();
        };
        tokio::select! {
            biased;
            _ = stop.cancelled() => false,
            _ = limiter.until_ready() => true,
        }
    }

    /// Take a permit if one is available right now
    pub fn try_acquire(&self) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }

    /// Whether a cap is configured
    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Configured cap
    pub fn requests_per_second(&self) -> Option<f64> {
        self.requests_per_second
    }
}

impl Default for RequestRateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl std::fmt::Debug for RequestRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRateLimiter")
            .field("requests_per_second", &self.requests_per_second)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_variants() {
        assert!(!RequestRateLimiter::new(None).is_enabled());
        assert!(!RequestRateLimiter::new(Some(0.0)).is_enabled());
        assert!(!RequestRateLimiter::new(Some(-3.0)).is_enabled());
        assert!(!RequestRateLimiter::default().is_enabled());
    }

    #[test]
    fn test_fractional_rate_rounds_up() {
        let limiter = RequestRateLimiter::new(Some(0.5));
        assert!(limiter.is_enabled());
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_burst_is_bounded() {
        let limiter = RequestRateLimiter::new(Some(2.0));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_acquire_unlimited() {
        let limiter = RequestRateLimiter::unlimited();
        assert!(limiter.acquire(&CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn test_acquire_after_stop() {
        let limiter = RequestRateLimiter::new(Some(1.0));
        let stop = CancellationToken::new();
        assert!(limiter.try_acquire());
        stop.cancel();
        assert!(!limiter.acquire(&stop).await);
    }
}

//! Per-provider token bucket

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tracing::debug;

use super::GatewayError;

/// Configured budget of one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitBudget {
    pub requests_per_minute: u32,
    pub burst: u32,
}

/// Token bucket refilled at `requests_per_minute`, holding up to `burst` tokens
pub struct ProviderRateLimiter {
    provider: String,
    budget: RateLimitBudget,
    limiter: DefaultDirectRateLimiter,
}

impl std::fmt::Debug for ProviderRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRateLimiter")
            .field("provider", &self.provider)
            .field("budget", &self.budget)
            .finish()
    }
}

impl ProviderRateLimiter {
    pub fn new(provider: impl Into<String>, requests_per_minute: u32, burst: u32) -> Self {
        let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let burst_nz = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_minute(rpm).allow_burst(burst_nz);
        Self {
            provider: provider.into(),
            budget: RateLimitBudget {
                requests_per_minute: rpm.get(),
                burst: burst_nz.get(),
            },
            limiter: RateLimiter::direct(quota),
        }
    }

    pub fn budget(&self) -> RateLimitBudget {
        self.budget
    }

    /// Take a token if one is available now
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Take a token, waiting at most `max_wait`
    pub async fn acquire(&self, max_wait: Duration) -> Result<(), GatewayError> {
        if self.try_acquire() {
            return Ok(());
        }

        let started = Instant::now();
        debug!(provider = %self.provider, max_wait_ms = max_wait.as_millis() as u64, "Waiting for rate-limit token");
        match tokio::time::timeout(max_wait, self.limiter.until_ready()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(GatewayError::RateLimitExceeded {
                provider: self.provider.clone(),
                waited_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }
}

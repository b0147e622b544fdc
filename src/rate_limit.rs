//! Request rate limits of the form "10/s" or "600/m".
//!
//! Applied on top of the concurrency bound: `--batch-size` caps how many
//! calls are in flight, the rate limit caps how often new ones start.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// A cap on how many LLM requests may start per period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimit {
    /// The maximum number of requests allowed in the period.
    pub max_requests: usize,
    /// The period over which the limit applies.
    pub period: Duration,
}

impl RateLimit {
    /// Create a [`RateLimiter`] enforcing this limit.
    ///
    /// The bucket starts full, so a burst of up to `max_requests` may go
    /// out immediately after startup.
    pub fn to_rate_limiter(&self) -> RateLimiter {
        RateLimiter::builder()
            .initial(self.max_requests)
            .refill(self.max_requests)
            .max(self.max_requests)
            .interval(self.period)
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = if self.period == Duration::from_secs(60) {
            "m"
        } else {
            "s"
        };
        write!(f, "{}/{}", self.max_requests, unit)
    }
}

impl<'de> Deserialize<'de> for RateLimit {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (count, unit) = s
            .split_once('/')
            .ok_or_else(|| anyhow!("expected a rate limit like \"10/s\", found {s:?}"))?;
        let max_requests = count
            .parse::<usize>()
            .with_context(|| format!("invalid request count in rate limit {s:?}"))?;
        let period = match unit {
            "s" => Duration::from_secs(1),
            "m" => Duration::from_secs(60),
            _ => bail!("rate limit period must be \"s\" or \"m\", found {unit:?}"),
        };
        Ok(Self {
            max_requests,
            period,
        })
    }
}

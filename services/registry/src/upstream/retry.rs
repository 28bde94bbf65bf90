use std::time::Duration;

use http::StatusCode;

/// A policy for retrying requests with exponential backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    /// The initial delay for the backoff
    pub delay: Duration,

    /// The exponent to increase the delay by
    pub exponent: u32,

    /// The maximum delay for the backoff
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_millis(200), 2, Duration::from_secs(10))
    }
}

impl Backoff {
    /// Create a new backoff policy.
    pub fn new(delay: Duration, exponent: u32, max_delay: Duration) -> Self {
        Self {
            delay,
            exponent,
            max_delay,
        }
    }

    /// The next step, with the delay capped at `max_delay`.
    pub fn increment(&self) -> Self {
        let delay = self
            .delay
            .checked_mul(self.exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        Self {
            delay,
            exponent: self.exponent,
            max_delay: self.max_delay,
        }
    }

    /// The delay to use when the server has rate limited the request with an explicit delay.
    pub fn rate_limited(&self, delay: Duration) -> Duration {
        delay.min(self.max_delay)
    }
}

/// Whether a response should be retried, and after how long if the server said so.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retry {
    /// Hand the response to the caller.
    No,

    /// Try again, optionally after a server provided delay.
    After(Option<Duration>),
}

pub(crate) fn classify(status: StatusCode, headers: &http::HeaderMap) -> Retry {
    match status {
        StatusCode::TOO_MANY_REQUESTS => Retry::After(retry_after(headers)),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Retry::After(None),
        status if status.is_server_error() => Retry::After(None),
        _ => Retry::No,
    }
}

fn retry_after(headers: &http::HeaderMap) -> Option<Duration> {
    headers
        .get(http::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), 3, Duration::from_millis(500));
        let next = backoff.increment();
        assert_eq!(next.delay, Duration::from_millis(300));
        assert_eq!(next.increment().delay, Duration::from_millis(500));
        assert_eq!(backoff.rate_limited(Duration::from_secs(60)), Duration::from_millis(500));
    }

    #[test]
    fn classification() {
        let mut headers = http::HeaderMap::new();
        assert_eq!(classify(StatusCode::OK, &headers), Retry::No);
        assert_eq!(classify(StatusCode::NOT_FOUND, &headers), Retry::No);
        assert_eq!(
            classify(StatusCode::SERVICE_UNAVAILABLE, &headers),
            Retry::After(None)
        );

        headers.insert(http::header::RETRY_AFTER, "2".parse().unwrap());
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, &headers),
            Retry::After(Some(Duration::from_secs(2)))
        );
    }
}

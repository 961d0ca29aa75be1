//! Upstream API rate-limit tracking.
//!
//! Reads `X-RateLimit-Remaining` / `X-RateLimit-Reset` (or the standardised
//! `RateLimit-Remaining` / `RateLimit-Reset`) and `Retry-After` from API
//! responses so the publisher can pace itself before hitting the limit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Point-in-time view of the rate-limit budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    /// Remaining calls in the current window, if the server reported it.
    pub remaining: Option<u64>,
    /// Unix timestamp at which the window resets.
    pub reset_at: Option<u64>,
    /// Unix timestamp before which the server asked us not to retry.
    pub retry_not_before: Option<u64>,
}

/// Shared rate-limit state updated after every API response.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    remaining: Arc<AtomicU64>,
    reset_at: Arc<AtomicU64>,
    retry_not_before: Arc<AtomicU64>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitState {
    pub fn new() -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(u64::MAX)),
            reset_at: Arc::new(AtomicU64::new(0)),
            retry_not_before: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Budget as last reported; fields the server never sent are `None`.
    pub fn snapshot(&self) -> RateLimitSnapshot {
        let known = |cell: &AtomicU64, unset: u64| {
            let value = cell.load(Ordering::Relaxed);
            (value != unset).then_some(value)
        };
        RateLimitSnapshot {
            remaining: known(&self.remaining, u64::MAX),
            reset_at: known(&self.reset_at, 0),
            retry_not_before: known(&self.retry_not_before, 0),
        }
    }

    /// Update state from HTTP response headers.
    ///
    /// Accepts both `X-RateLimit-*` (GitHub/Gitea) and `RateLimit-*`
    /// (IETF draft) header names. `Retry-After` is only honoured in its
    /// delay-seconds form.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        self.update_at(headers, chrono::Utc::now().timestamp() as u64);
    }

    fn update_at(&self, headers: &reqwest::header::HeaderMap, now: u64) {
        let numeric = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| headers.get(*name))
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
        };

        let remaining = numeric(&["X-RateLimit-Remaining", "RateLimit-Remaining"]);
        let reset = numeric(&["X-RateLimit-Reset", "RateLimit-Reset"]);
        let retry_after = numeric(&["Retry-After"]);

        if let Some(r) = remaining {
            self.remaining.store(r, Ordering::Relaxed);
        }
        if let Some(r) = reset {
            self.reset_at.store(r, Ordering::Relaxed);
        }
        match retry_after {
            Some(secs) => {
                self.retry_not_before.store(now + secs, Ordering::Relaxed);
            }
            None => self.retry_not_before.store(0, Ordering::Relaxed),
        }

        debug!(?remaining, ?reset, ?retry_after, "rate limit headers observed");
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderMap;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn nothing_known_before_first_response() {
        let snap = RateLimitState::new().snapshot();
        assert_eq!(snap.remaining, None);
        assert_eq!(snap.reset_at, None);
        assert_eq!(snap.retry_not_before, None);
    }

    #[test]
    fn github_and_ietf_header_names_are_both_read() {
        let github = RateLimitState::new();
        github.update_at(
            &headers(&[("x-ratelimit-remaining", "4999"), ("x-ratelimit-reset", "1700000000")]),
            1_000,
        );
        assert_eq!(github.snapshot().remaining, Some(4999));
        assert_eq!(github.snapshot().reset_at, Some(1_700_000_000));

        let ietf = RateLimitState::new();
        ietf.update_at(&headers(&[("ratelimit-remaining", " 7 ")]), 1_000);
        assert_eq!(ietf.snapshot().remaining, Some(7));
        assert_eq!(ietf.snapshot().reset_at, None);
    }

    #[test]
    fn budget_survives_responses_without_headers() {
        let state = RateLimitState::new();
        state.update_at(&headers(&[("x-ratelimit-remaining", "12")]), 1_000);
        state.update_at(&HeaderMap::new(), 1_001);
        assert_eq!(state.snapshot().remaining, Some(12));
    }

    #[test]
    fn retry_after_is_anchored_to_now_and_expires_with_next_response() {
        let state = RateLimitState::new();
        state.update_at(&headers(&[("retry-after", "60")]), 1_000);
        assert_eq!(state.snapshot().retry_not_before, Some(1_060));

        state.update_at(&headers(&[("x-ratelimit-remaining", "100")]), 1_010);
        assert_eq!(state.snapshot().retry_not_before, None);
    }

    #[test]
    fn http_date_retry_after_and_junk_are_ignored() {
        let state = RateLimitState::new();
        state.update_at(
            &headers(&[
                ("retry-after", "Wed, 21 Oct 2015 07:28:00 GMT"),
                ("x-ratelimit-remaining", "plenty"),
            ]),
            1_000,
        );
        assert_eq!(state.snapshot(), RateLimitState::new().snapshot());
    }

    #[test]
    fn clones_share_state() {
        let state = RateLimitState::new();
        let handle = state.clone();
        handle.update_from_headers(&headers(&[("x-ratelimit-remaining", "3")]));
        assert_eq!(state.snapshot().remaining, Some(3));
    }
}

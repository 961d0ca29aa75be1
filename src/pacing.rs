//! Request pacing between blob uploads.
//!
//! Enforces a minimum gap between consecutive uploads and, in adaptive mode,
//! waits out the rate-limit window when the server reports that the budget
//! is nearly spent or asks for a `Retry-After` pause.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{PacingConfig, PacingMode};
use crate::store::RateLimitSnapshot;

/// How long to sleep before the next request, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingDecision {
    pub delay: Duration,
    /// The delay comes from the server's rate limit, not the fixed interval.
    pub throttled: bool,
}

#[derive(Debug)]
pub struct Pacer {
    mode: PacingMode,
    min_interval: Duration,
    buffer: u64,
    max_wait: Duration,
    last_request: Option<Instant>,
}

impl Pacer {
    pub fn new(config: &PacingConfig) -> Self {
        Self {
            mode: config.mode,
            min_interval: Duration::from_millis(config.min_interval_ms),
            buffer: u64::from(config.rate_limit_buffer),
            max_wait: Duration::from_secs(config.max_wait_secs),
            last_request: None,
        }
    }

    /// A pacer that never waits.
    pub fn unpaced() -> Self {
        Self::new(&PacingConfig {
            mode: PacingMode::None,
            ..PacingConfig::default()
        })
    }

    /// Record that a request was just issued.
    pub fn mark(&mut self) {
        self.last_request = Some(Instant::now());
    }

    pub fn decide(
        &self,
        now: Instant,
        now_unix: u64,
        snapshot: Option<RateLimitSnapshot>,
    ) -> PacingDecision {
        if self.mode == PacingMode::None {
            return PacingDecision {
                delay: Duration::ZERO,
                throttled: false,
            };
        }

        let interval = self
            .last_request
            .map(|last| self.min_interval.saturating_sub(now.duration_since(last)))
            .unwrap_or(Duration::ZERO);

        let mut server_wait = Duration::ZERO;
        if self.mode == PacingMode::Adaptive {
            if let Some(snapshot) = snapshot {
                if let Some(until) = snapshot.retry_not_before {
                    server_wait = server_wait.max(Duration::from_secs(until.saturating_sub(now_unix)));
                }
                if let (Some(remaining), Some(reset)) = (snapshot.remaining, snapshot.reset_at) {
                    if remaining < self.buffer {
                        server_wait =
                            server_wait.max(Duration::from_secs(reset.saturating_sub(now_unix)));
                    }
                }
            }
            server_wait = server_wait.min(self.max_wait);
        }

        if server_wait > interval {
            PacingDecision {
                delay: server_wait,
                throttled: true,
            }
        } else {
            PacingDecision {
                delay: interval,
                throttled: false,
            }
        }
    }

    /// Sleep as long as [`Pacer::decide`] says, unless `cancel` fires.
    ///
    /// Returns the decision that was applied, or `None` if cancelled.
    pub async fn wait(
        &self,
        snapshot: Option<RateLimitSnapshot>,
        cancel: &CancellationToken,
    ) -> Option<PacingDecision> {
        let now_unix = chrono::Utc::now().timestamp().max(0) as u64;
        let decision = self.decide(Instant::now(), now_unix, snapshot);
        if decision.throttled {
            info!(
                wait_secs = decision.delay.as_secs(),
                remaining = ?snapshot.and_then(|s| s.remaining),
                "self-throttling: rate limit approaching"
            );
        }
        if decision.delay.is_zero() {
            return (!cancel.is_cancelled()).then_some(decision);
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            () = tokio::time::sleep(decision.delay) => Some(decision),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacer(mode: PacingMode) -> Pacer {
        Pacer::new(&PacingConfig {
            mode,
            min_interval_ms: 50,
            rate_limit_buffer: 10,
            max_wait_secs: 60,
        })
    }

    fn snapshot(remaining: u64, reset_at: u64) -> RateLimitSnapshot {
        RateLimitSnapshot {
            remaining: Some(remaining),
            reset_at: Some(reset_at),
            retry_not_before: None,
        }
    }

    #[test]
    fn first_request_is_not_delayed() {
        let p = pacer(PacingMode::Fixed);
        let d = p.decide(Instant::now(), 1_000, None);
        assert_eq!(d.delay, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_mode_enforces_min_interval() {
        let mut p = pacer(PacingMode::Fixed);
        p.mark();
        tokio::time::advance(Duration::from_millis(20)).await;
        let d = p.decide(Instant::now(), 1_000, Some(snapshot(0, 2_000)));
        assert_eq!(d.delay, Duration::from_millis(30));
        assert!(!d.throttled);
    }

    #[test]
    fn adaptive_waits_for_reset_when_budget_low() {
        let p = pacer(PacingMode::Adaptive);
        let d = p.decide(Instant::now(), 1_000, Some(snapshot(5, 1_020)));
        assert_eq!(d.delay, Duration::from_secs(20));
        assert!(d.throttled);
    }

    #[test]
    fn adaptive_ignores_healthy_budget() {
        let p = pacer(PacingMode::Adaptive);
        let d = p.decide(Instant::now(), 1_000, Some(snapshot(500, 1_020)));
        assert_eq!(d.delay, Duration::ZERO);
    }

    #[test]
    fn adaptive_honours_retry_after_and_caps_wait() {
        let p = pacer(PacingMode::Adaptive);
        let snap = RateLimitSnapshot {
            remaining: None,
            reset_at: None,
            retry_not_before: Some(1_500),
        };
        let d = p.decide(Instant::now(), 1_000, Some(snap));
        assert_eq!(d.delay, Duration::from_secs(60));
        assert!(d.throttled);
    }

    #[test]
    fn none_mode_never_waits() {
        let mut p = pacer(PacingMode::None);
        p.mark();
        let d = p.decide(Instant::now(), 1_000, Some(snapshot(0, 5_000)));
        assert_eq!(d.delay, Duration::ZERO);
    }

    #[tokio::test]
    async fn wait_returns_none_when_cancelled() {
        let p = pacer(PacingMode::Adaptive);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let far_future = chrono::Utc::now().timestamp() as u64 + 30;
        assert!(p.wait(Some(snapshot(0, far_future)), &cancel).await.is_none());
    }
}

//! Backoff and rate-limit bookkeeping for the gateway.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::provider::ProviderRoute;

/// Exponential backoff with full jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    /// Creates a policy whose ceiling doubles from `base` up to `cap`.
    #[must_use]
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Upper bound of the delay for the given 1-based attempt.
    #[must_use]
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1).min(20));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Random delay in `[0, ceiling(attempt)]`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=millis))
    }
}

/// Where to send the next attempt after a 429.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Another route is free; retry there immediately.
    Switch(ProviderRoute),
    /// Every route is limited; wait, then retry on this route.
    Wait(ProviderRoute, Duration),
}

/// Remembers until when each route is rate limited.
///
/// Shared by every call through one gateway, so a 429 seen by one worker
/// steers the others too.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    limited_until: Mutex<HashMap<ProviderRoute, Instant>>,
}

impl RateLimitTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a 429 on `route` that resets after `reset_after`.
    pub fn mark_limited(&self, route: ProviderRoute, reset_after: Duration) {
        let until = Instant::now() + reset_after;
        if let Ok(mut map) = self.limited_until.lock() {
            map.insert(route, until);
        }
    }

    /// Forgets any limit on `route` (it just served a request).
    pub fn clear(&self, route: ProviderRoute) {
        if let Ok(mut map) = self.limited_until.lock() {
            map.remove(&route);
        }
    }

    /// Time left before `route` resets, `None` when it is not limited.
    #[must_use]
    pub fn remaining(&self, route: ProviderRoute) -> Option<Duration> {
        let now = Instant::now();
        self.limited_until
            .lock()
            .ok()
            .and_then(|map| map.get(&route).copied())
            .and_then(|until| until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    /// First route in `routes` that is not currently limited.
    #[must_use]
    pub fn preferred(&self, routes: &[ProviderRoute]) -> Option<ProviderRoute> {
        routes
            .iter()
            .copied()
            .find(|r| self.remaining(*r).is_none())
            .or_else(|| routes.first().copied())
    }

    /// Decides the next route after `current` was rate limited.
    ///
    /// Prefers any other route that is free right now; otherwise waits for
    /// whichever limited route resets first.
    #[must_use]
    pub fn after_rate_limit(
        &self,
        current: ProviderRoute,
        routes: &[ProviderRoute],
        fallback_wait: Duration,
    ) -> RouteDecision {
        if let Some(free) = routes
            .iter()
            .copied()
            .find(|r| *r != current && self.remaining(*r).is_none())
        {
            return RouteDecision::Switch(free);
        }
        routes
            .iter()
            .copied()
            .filter_map(|r| self.remaining(r).map(|d| (r, d)))
            .min_by_key(|(_, d)| *d)
            .map_or(
                RouteDecision::Wait(current, fallback_wait),
                |(route, wait)| RouteDecision::Wait(route, wait),
            )
    }

    /// Next route for a server-error retry: alternate when possible.
    #[must_use]
    pub fn alternate(&self, current: ProviderRoute, routes: &[ProviderRoute]) -> ProviderRoute {
        routes
            .iter()
            .copied()
            .find(|r| *r != current && self.remaining(*r).is_none())
            .unwrap_or(current)
    }
}

/// Sleeps for `duration` unless `cancel` fires first.
///
/// Returns `false` when cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIRECT: ProviderRoute = ProviderRoute::AnthropicDirect;
    const MANAGED: ProviderRoute = ProviderRoute::AnthropicManaged;

    #[test]
    fn test_backoff_ceiling_doubles_and_caps() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.ceiling(1), Duration::from_secs(1));
        assert_eq!(policy.ceiling(2), Duration::from_secs(2));
        assert_eq!(policy.ceiling(4), Duration::from_secs(8));
        assert_eq!(policy.ceiling(10), Duration::from_secs(60));
        assert_eq!(policy.ceiling(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_delay_within_ceiling() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5));
        for attempt in 1..8 {
            assert!(policy.delay(attempt) <= policy.ceiling(attempt));
        }
        let zero = BackoffPolicy::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(zero.delay(3), Duration::ZERO);
    }

    #[test]
    fn test_switch_to_free_route() {
        let tracker = RateLimitTracker::new();
        tracker.mark_limited(DIRECT, Duration::from_secs(30));
        let decision = tracker.after_rate_limit(DIRECT, &[DIRECT, MANAGED], Duration::from_secs(10));
        assert_eq!(decision, RouteDecision::Switch(MANAGED));
    }

    #[test]
    fn test_wait_for_earliest_reset_when_both_limited() {
        let tracker = RateLimitTracker::new();
        tracker.mark_limited(DIRECT, Duration::from_secs(30));
        tracker.mark_limited(MANAGED, Duration::from_secs(5));
        match tracker.after_rate_limit(DIRECT, &[DIRECT, MANAGED], Duration::from_secs(10)) {
            RouteDecision::Wait(route, wait) => {
                assert_eq!(route, MANAGED);
                assert!(wait <= Duration::from_secs(5));
            }
            RouteDecision::Switch(_) => unreachable!(),
        }
    }

    #[test]
    fn test_single_route_waits_on_same_route() {
        let tracker = RateLimitTracker::new();
        tracker.mark_limited(ProviderRoute::OpenAi, Duration::from_secs(2));
        match tracker.after_rate_limit(
            ProviderRoute::OpenAi,
            &[ProviderRoute::OpenAi],
            Duration::from_secs(10),
        ) {
            RouteDecision::Wait(route, wait) => {
                assert_eq!(route, ProviderRoute::OpenAi);
                assert!(wait <= Duration::from_secs(2));
            }
            RouteDecision::Switch(_) => unreachable!(),
        }
    }

    #[test]
    fn test_clear_and_preferred() {
        let tracker = RateLimitTracker::new();
        tracker.mark_limited(DIRECT, Duration::from_secs(30));
        assert_eq!(tracker.preferred(&[DIRECT, MANAGED]), Some(MANAGED));
        tracker.clear(DIRECT);
        assert_eq!(tracker.preferred(&[DIRECT, MANAGED]), Some(DIRECT));
        assert_eq!(tracker.preferred(&[]), None);
    }

    #[test]
    fn test_alternate() {
        let tracker = RateLimitTracker::new();
        assert_eq!(tracker.alternate(DIRECT, &[DIRECT, MANAGED]), MANAGED);
        assert_eq!(tracker.alternate(DIRECT, &[DIRECT]), DIRECT);
    }

    #[tokio::test]
    async fn test_sleep_or_cancel() {
        let cancel = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_millis(1), &cancel).await);
        cancel.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(60), &cancel).await);
    }
}

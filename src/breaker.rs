//! Per-provider circuit breakers
//!
//! A breaker stops the orchestrator from hammering a failing provider:
//! consecutive transient failures open it, open means fail-fast without a
//! network call, and after a cooldown exactly one probe is let through to
//! test recovery. The registry owns one breaker per provider - explicit
//! state keyed by provider, not module-level singletons - and is shared
//! across the worker pool.
//!
//! State transitions:
//! ```text
//! Closed   -> Open:     consecutive failures reach the threshold
//! Open     -> HalfOpen: cooldown elapsed (next check admits one probe)
//! HalfOpen -> Closed:   probe succeeds (failure counter reset)
//! HalfOpen -> Open:     probe fails (cooldown grows, bounded exponential)
//! ```

use crate::clock::SharedClock;
use crate::config::BreakerConfig;
use crate::metrics;
use crate::model::Provider;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding for the metrics gauge (0 = closed, 1 = half-open,
    /// 2 = open)
    pub fn as_gauge(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }
}

/// Outcome of consulting a breaker before a provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Call may proceed (normal traffic, or the single half-open probe)
    Allow,
    /// Fail fast; retry no sooner than `retry_after`
    Reject { retry_after: Duration },
}

/// Point-in-time view of one breaker, for metrics and operators
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_transition: DateTime<Utc>,
    pub cooldown: Duration,
}

struct ProviderBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    /// Failed half-open probes since the breaker first opened; drives the
    /// cooldown growth
    probe_failures: u32,
    /// A half-open probe has been admitted and has not reported back yet
    probe_in_flight: bool,
    opened_at: Option<DateTime<Utc>>,
    cooldown: Duration,
    last_transition: DateTime<Utc>,
}

impl ProviderBreaker {
    fn new(config: &BreakerConfig, now: DateTime<Utc>) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            probe_failures: 0,
            probe_in_flight: false,
            opened_at: None,
            cooldown: config.cooldown_after(0),
            last_transition: now,
        }
    }
}

/// Registry of per-provider breakers
pub struct BreakerRegistry {
    config: BreakerConfig,
    clock: SharedClock,
    breakers: Mutex<HashMap<Provider, ProviderBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Consult the breaker before a provider call
    ///
    /// Open breakers whose cooldown has elapsed transition to half-open
    /// here, admitting the caller as the single probe.
    pub fn check(&self, provider: Provider) -> BreakerDecision {
        let now = self.clock.now();
        let mut breakers = self.breakers.lock().unwrap();
        let breaker = breakers
            .entry(provider)
            .or_insert_with(|| ProviderBreaker::new(&self.config, now));

        let decision = match breaker.state {
            BreakerState::Closed => BreakerDecision::Allow,
            BreakerState::Open => {
                let reopen_at = breaker
                    .opened_at
                    .unwrap_or(breaker.last_transition)
                    + chrono::Duration::from_std(breaker.cooldown)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));

                if now >= reopen_at {
                    breaker.state = BreakerState::HalfOpen;
                    breaker.probe_in_flight = true;
                    breaker.last_transition = now;
                    info!(provider = %provider, "Circuit breaker half-open, admitting probe");
                    BreakerDecision::Allow
                } else {
                    let remaining = (reopen_at - now)
                        .to_std()
                        .unwrap_or(breaker.cooldown);
                    BreakerDecision::Reject {
                        retry_after: remaining,
                    }
                }
            }
            BreakerState::HalfOpen => {
                if breaker.probe_in_flight {
                    // Exactly one probe at a time
                    BreakerDecision::Reject {
                        retry_after: breaker.cooldown,
                    }
                } else {
                    breaker.probe_in_flight = true;
                    BreakerDecision::Allow
                }
            }
        };

        Self::publish(provider, breaker);
        decision
    }

    /// Record a successful provider call
    pub fn record_success(&self, provider: Provider) {
        let now = self.clock.now();
        let mut breakers = self.breakers.lock().unwrap();
        let breaker = breakers
            .entry(provider)
            .or_insert_with(|| ProviderBreaker::new(&self.config, now));

        match breaker.state {
            BreakerState::Closed => {
                // Only consecutive failures count
                breaker.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                info!(provider = %provider, "Circuit breaker probe succeeded, closing");
                breaker.state = BreakerState::Closed;
                breaker.consecutive_failures = 0;
                breaker.probe_failures = 0;
                breaker.probe_in_flight = false;
                breaker.opened_at = None;
                breaker.cooldown = self.config.cooldown_after(0);
                breaker.last_transition = now;
            }
            // A success while open can only come from a call admitted
            // before the breaker tripped; the fail-fast gate stays until
            // a probe confirms recovery
            BreakerState::Open => {}
        }

        Self::publish(provider, breaker);
    }

    /// Record a transient provider failure
    ///
    /// Permanent failures are not dependency-health signals and must not
    /// be reported here.
    pub fn record_failure(&self, provider: Provider) {
        let now = self.clock.now();
        let mut breakers = self.breakers.lock().unwrap();
        let breaker = breakers
            .entry(provider)
            .or_insert_with(|| ProviderBreaker::new(&self.config, now));

        match breaker.state {
            BreakerState::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        provider = %provider,
                        failures = breaker.consecutive_failures,
                        cooldown_secs = breaker.cooldown.as_secs(),
                        "Circuit breaker opened"
                    );
                    breaker.state = BreakerState::Open;
                    breaker.opened_at = Some(now);
                    breaker.last_transition = now;
                }
            }
            BreakerState::HalfOpen => {
                breaker.probe_failures += 1;
                breaker.cooldown = self.config.cooldown_after(breaker.probe_failures);
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(now);
                breaker.probe_in_flight = false;
                breaker.last_transition = now;
                warn!(
                    provider = %provider,
                    probe_failures = breaker.probe_failures,
                    cooldown_secs = breaker.cooldown.as_secs(),
                    "Circuit breaker probe failed, reopening with longer cooldown"
                );
            }
            BreakerState::Open => {
                // Late failure from a call admitted before the trip
                breaker.consecutive_failures += 1;
            }
        }

        Self::publish(provider, breaker);
    }

    /// Release an admitted probe that will not report an outcome
    ///
    /// Used when a probe call is abandoned before reaching the provider
    /// (rate-limit denial, missing snapshot) or resolves with a permanent
    /// error, which is not a dependency-health signal either way. The
    /// breaker stays half-open and the next check admits a fresh probe.
    pub fn release_probe(&self, provider: Provider) {
        let mut breakers = self.breakers.lock().unwrap();
        if let Some(breaker) = breakers.get_mut(&provider) {
            if breaker.state == BreakerState::HalfOpen {
                breaker.probe_in_flight = false;
            }
        }
    }

    /// Current view of one provider's breaker
    pub fn snapshot(&self, provider: Provider) -> BreakerSnapshot {
        let now = self.clock.now();
        let mut breakers = self.breakers.lock().unwrap();
        let breaker = breakers
            .entry(provider)
            .or_insert_with(|| ProviderBreaker::new(&self.config, now));
        BreakerSnapshot {
            state: breaker.state,
            consecutive_failures: breaker.consecutive_failures,
            last_transition: breaker.last_transition,
            cooldown: breaker.cooldown,
        }
    }

    fn publish(provider: Provider, breaker: &ProviderBreaker) {
        metrics::set_breaker_state(provider.code(), breaker.state.as_gauge());
        metrics::set_breaker_failures(provider.code(), breaker.consecutive_failures as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn registry() -> (BreakerRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let config = BreakerConfig::default(); // threshold 5, cooldown 30s
        (BreakerRegistry::new(config, clock.clone()), clock)
    }

    #[test]
    fn test_opens_after_threshold_consecutive_failures() {
        let (registry, _) = registry();
        let provider = Provider::QuickBooks;

        for _ in 0..4 {
            registry.record_failure(provider);
            assert_eq!(registry.snapshot(provider).state, BreakerState::Closed);
        }
        registry.record_failure(provider);
        assert_eq!(registry.snapshot(provider).state, BreakerState::Open);
        assert!(matches!(
            registry.check(provider),
            BreakerDecision::Reject { .. }
        ));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let (registry, _) = registry();
        let provider = Provider::QuickBooks;

        for _ in 0..4 {
            registry.record_failure(provider);
        }
        registry.record_success(provider);
        assert_eq!(registry.snapshot(provider).consecutive_failures, 0);

        // Needs a full run of 5 again to open
        for _ in 0..4 {
            registry.record_failure(provider);
        }
        assert_eq!(registry.snapshot(provider).state, BreakerState::Closed);
        registry.record_failure(provider);
        assert_eq!(registry.snapshot(provider).state, BreakerState::Open);
    }

    #[test]
    fn test_half_open_admits_exactly_one_probe() {
        let (registry, clock) = registry();
        let provider = Provider::Xero;

        for _ in 0..5 {
            registry.record_failure(provider);
        }
        clock.advance(chrono::Duration::seconds(31));

        // First check after cooldown is the probe
        assert_eq!(registry.check(provider), BreakerDecision::Allow);
        assert_eq!(registry.snapshot(provider).state, BreakerState::HalfOpen);

        // While the probe is in flight, everything else is rejected
        assert!(matches!(
            registry.check(provider),
            BreakerDecision::Reject { .. }
        ));
    }

    #[test]
    fn test_probe_success_closes_and_resets() {
        let (registry, clock) = registry();
        let provider = Provider::Xero;

        for _ in 0..5 {
            registry.record_failure(provider);
        }
        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(registry.check(provider), BreakerDecision::Allow);

        registry.record_success(provider);
        let snapshot = registry.snapshot(provider);
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(registry.check(provider), BreakerDecision::Allow);
    }

    #[test]
    fn test_probe_failure_reopens_with_longer_cooldown() {
        let (registry, clock) = registry();
        let provider = Provider::QuickBooks;

        for _ in 0..5 {
            registry.record_failure(provider);
        }
        let first_cooldown = registry.snapshot(provider).cooldown;

        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(registry.check(provider), BreakerDecision::Allow);
        registry.record_failure(provider);

        let snapshot = registry.snapshot(provider);
        assert_eq!(snapshot.state, BreakerState::Open);
        assert_eq!(snapshot.cooldown, first_cooldown * 2);

        // Still rejecting before the longer cooldown elapses
        clock.advance(chrono::Duration::seconds(31));
        assert!(matches!(
            registry.check(provider),
            BreakerDecision::Reject { .. }
        ));
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(registry.check(provider), BreakerDecision::Allow);
    }

    #[test]
    fn test_released_probe_allows_a_fresh_one() {
        let (registry, clock) = registry();
        let provider = Provider::Xero;

        for _ in 0..5 {
            registry.record_failure(provider);
        }
        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(registry.check(provider), BreakerDecision::Allow);

        // The probe call never reached the provider; release it
        registry.release_probe(provider);
        assert_eq!(registry.check(provider), BreakerDecision::Allow);
    }

    #[test]
    fn test_providers_are_isolated() {
        let (registry, _) = registry();

        for _ in 0..5 {
            registry.record_failure(Provider::QuickBooks);
        }
        assert_eq!(
            registry.snapshot(Provider::QuickBooks).state,
            BreakerState::Open
        );
        assert_eq!(registry.check(Provider::Xero), BreakerDecision::Allow);
    }
}

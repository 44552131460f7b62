//! Per-provider rate limiting
//!
//! Fixed-window admission control matching each provider's published API
//! quota. Distinct from the breaker: the limiter throttles *healthy*
//! traffic to respect quotas, the breaker stops traffic to a *failing*
//! dependency. Both gates are consulted, independently, before every
//! provider call.

use crate::clock::SharedClock;
use crate::config::QuotaConfig;
use crate::metrics;
use crate::model::Provider;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Outcome of an admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Quota exhausted for the current window; retry no sooner than
    /// `retry_after` (always at most one window length)
    Denied { retry_after: Duration },
}

struct ProviderWindow {
    window_start: DateTime<Utc>,
    used: u32,
}

/// Registry of per-provider admission windows
pub struct RateLimiterRegistry {
    clock: SharedClock,
    /// Quota per provider, fixed at startup from configuration
    quotas: HashMap<Provider, QuotaConfig>,
    windows: Mutex<HashMap<Provider, ProviderWindow>>,
}

impl RateLimiterRegistry {
    pub fn new(quotas: HashMap<Provider, QuotaConfig>, clock: SharedClock) -> Self {
        Self {
            clock,
            quotas,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn quota(&self, provider: Provider) -> QuotaConfig {
        self.quotas.get(&provider).cloned().unwrap_or_default()
    }

    /// Request admission for one call to the given provider
    ///
    /// A deny is "not yet", never a failure: callers requeue with the
    /// suggested delay and do not count an attempt.
    pub fn try_acquire(&self, provider: Provider) -> Admission {
        let quota = self.quota(provider);
        let window = chrono::Duration::milliseconds(quota.window_ms as i64);
        let now = self.clock.now();

        let mut windows = self.windows.lock().unwrap();
        let entry = windows.entry(provider).or_insert(ProviderWindow {
            window_start: now,
            used: 0,
        });

        // New window: reset and admit
        if now - entry.window_start >= window {
            entry.window_start = now;
            entry.used = 1;
            Self::publish(provider, &quota, entry.used);
            return Admission::Allowed;
        }

        if entry.used >= quota.max_calls {
            let remaining = (entry.window_start + window) - now;
            let retry_after = remaining
                .to_std()
                .unwrap_or(Duration::from_millis(quota.window_ms));
            return Admission::Denied { retry_after };
        }

        entry.used += 1;
        Self::publish(provider, &quota, entry.used);
        Admission::Allowed
    }

    /// Tokens left in the current window
    pub fn remaining(&self, provider: Provider) -> u32 {
        let quota = self.quota(provider);
        let window = chrono::Duration::milliseconds(quota.window_ms as i64);
        let now = self.clock.now();

        let windows = self.windows.lock().unwrap();
        match windows.get(&provider) {
            Some(entry) if now - entry.window_start < window => {
                quota.max_calls.saturating_sub(entry.used)
            }
            _ => quota.max_calls,
        }
    }

    fn publish(provider: Provider, quota: &QuotaConfig, used: u32) {
        metrics::set_limiter_remaining(
            provider.code(),
            quota.max_calls.saturating_sub(used) as i64,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn registry(max_calls: u32, window_ms: u64) -> (RateLimiterRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let mut quotas = HashMap::new();
        quotas.insert(
            Provider::QuickBooks,
            QuotaConfig {
                max_calls,
                window_ms,
            },
        );
        quotas.insert(
            Provider::Xero,
            QuotaConfig {
                max_calls: 2,
                window_ms,
            },
        );
        (RateLimiterRegistry::new(quotas, clock.clone()), clock)
    }

    #[test]
    fn test_quota_exhaustion_denies_with_bounded_wait() {
        let (registry, _) = registry(3, 60_000);

        for _ in 0..3 {
            assert_eq!(
                registry.try_acquire(Provider::QuickBooks),
                Admission::Allowed
            );
        }

        // The (N+1)-th call within the window is denied, wait <= window
        match registry.try_acquire(Provider::QuickBooks) {
            Admission::Denied { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
            }
            Admission::Allowed => panic!("expected denial after quota exhaustion"),
        }
    }

    #[test]
    fn test_window_reset_restores_quota() {
        let (registry, clock) = registry(1, 1_000);

        assert_eq!(
            registry.try_acquire(Provider::QuickBooks),
            Admission::Allowed
        );
        assert!(matches!(
            registry.try_acquire(Provider::QuickBooks),
            Admission::Denied { .. }
        ));

        clock.advance(chrono::Duration::milliseconds(1_001));
        assert_eq!(
            registry.try_acquire(Provider::QuickBooks),
            Admission::Allowed
        );
    }

    #[test]
    fn test_quotas_are_per_provider() {
        let (registry, _) = registry(1, 60_000);

        assert_eq!(
            registry.try_acquire(Provider::QuickBooks),
            Admission::Allowed
        );
        assert!(matches!(
            registry.try_acquire(Provider::QuickBooks),
            Admission::Denied { .. }
        ));

        // Xero has its own window and quota
        assert_eq!(registry.try_acquire(Provider::Xero), Admission::Allowed);
        assert_eq!(registry.try_acquire(Provider::Xero), Admission::Allowed);
        assert!(matches!(
            registry.try_acquire(Provider::Xero),
            Admission::Denied { .. }
        ));
    }

    #[test]
    fn test_remaining_tracks_usage() {
        let (registry, _) = registry(3, 60_000);

        assert_eq!(registry.remaining(Provider::QuickBooks), 3);
        registry.try_acquire(Provider::QuickBooks);
        assert_eq!(registry.remaining(Provider::QuickBooks), 2);
    }
}

//! Capacity checks against configured ceilings
//!
//! `check` is an admission: on `Allow` one unit has already been counted.
//! A credential unit is also a pool unit, so checking a credential scope
//! consumes from both scopes together.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::monitor::{RateLimitDecision, Scope, UsageMonitor};

/// Rate limiter over a shared usage monitor.
#[derive(Clone)]
pub struct RateLimiter {
    monitor: Arc<UsageMonitor>,
}

impl RateLimiter {
    pub fn new(monitor: Arc<UsageMonitor>) -> Self {
        Self { monitor }
    }

    pub fn monitor(&self) -> &Arc<UsageMonitor> {
        &self.monitor
    }

    /// Check capacity for `scope` at the current time, consuming one unit on allow.
    ///
    /// Fails with `LimiterUnavailable` when accounting is broken; callers
    /// must treat that as a denial.
    pub fn check(&self, scope: &Scope) -> Result<RateLimitDecision> {
        self.check_at(scope, self.monitor.now_millis())
    }

    /// Same as `check` with an explicit timestamp (ms since epoch).
    pub fn check_at(&self, scope: &Scope, now_millis: u64) -> Result<RateLimitDecision> {
        let result = match scope {
            Scope::Pool => self.monitor.try_consume(&[Scope::Pool], now_millis),
            Scope::Credential(_) => self
                .monitor
                .try_consume(&[scope.clone(), Scope::Pool], now_millis),
        };

        let decision = match result {
            Ok(decision) => decision,
            Err(e) => {
                metrics::counter!(
                    "quota_decisions_total",
                    "scope" => scope.kind(),
                    "decision" => "unavailable"
                )
                .increment(1);
                return Err(e);
            }
        };

        metrics::counter!(
            "quota_decisions_total",
            "scope" => scope.kind(),
            "decision" => decision.label()
        )
        .increment(1);

        match decision {
            RateLimitDecision::Allow => debug!(scope = %scope, "capacity check allowed"),
            RateLimitDecision::Deny {
                retry_after,
                window,
            } => warn!(
                scope = %scope,
                %window,
                retry_after_ms = retry_after.as_millis() as u64,
                "pool quota ceiling reached"
            ),
            RateLimitDecision::Reroute {
                retry_after,
                window,
            } => debug!(
                scope = %scope,
                %window,
                retry_after_ms = retry_after.as_millis() as u64,
                "credential quota ceiling reached"
            ),
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::limits::Ceilings;
    use crate::window::Window;
    use std::sync::Barrier;
    use std::time::Duration;

    const T0: u64 = 1_767_225_600_000;

    fn limiter(pool: Ceilings, credential: Ceilings) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(T0));
        let monitor = Arc::new(UsageMonitor::new(clock.clone(), pool, credential));
        (clock, RateLimiter::new(monitor))
    }

    fn per_minute(n: u64) -> Ceilings {
        Ceilings {
            per_minute: Some(n),
            ..Ceilings::default()
        }
    }

    #[test]
    fn two_per_minute_allows_twice_then_denies() {
        let (clock, limiter) = limiter(per_minute(2), Ceilings::default());
        clock.advance(Duration::from_secs(5));

        assert_eq!(limiter.check(&Scope::Pool).unwrap(), RateLimitDecision::Allow);
        assert_eq!(limiter.check(&Scope::Pool).unwrap(), RateLimitDecision::Allow);
        let third = limiter.check(&Scope::Pool).unwrap();
        assert!(!third.is_allowed());
        let retry_after = third.retry_after().unwrap();
        assert!(retry_after <= Duration::from_secs(60), "got {retry_after:?}");
        assert_eq!(retry_after, Duration::from_secs(55));
    }

    #[test]
    fn single_credential_at_ceiling_is_not_allowed() {
        let (_clock, limiter) = limiter(Ceilings::default(), per_minute(2));
        let scope = Scope::credential("only");
        assert!(limiter.check(&scope).unwrap().is_allowed());
        assert!(limiter.check(&scope).unwrap().is_allowed());
        let third = limiter.check(&scope).unwrap();
        assert_eq!(
            third,
            RateLimitDecision::Reroute {
                retry_after: Duration::from_secs(60),
                window: Window::Minute
            }
        );
    }

    #[test]
    fn credential_check_consumes_pool_unit() {
        let (_clock, limiter) = limiter(per_minute(1), Ceilings::default());
        assert!(limiter.check(&Scope::credential("a")).unwrap().is_allowed());
        // Pool is now full: a different credential is denied outright.
        let decision = limiter.check(&Scope::credential("b")).unwrap();
        assert!(matches!(decision, RateLimitDecision::Deny { .. }));
    }

    #[test]
    fn allows_never_exceed_ceiling_in_one_window() {
        let (clock, limiter) = limiter(
            Ceilings {
                per_second: Some(3),
                per_minute: Some(10),
                ..Ceilings::default()
            },
            Ceilings::default(),
        );

        let mut allowed = 0;
        for i in 0..200 {
            // Spread calls over the first 50 seconds of the minute.
            clock.set(T0 + i * 250);
            if limiter.check(&Scope::Pool).unwrap().is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[test]
    fn concurrent_checks_on_last_unit_allow_exactly_one() {
        let (_clock, limiter) = limiter(per_minute(5), Ceilings::default());
        for _ in 0..4 {
            assert!(limiter.check(&Scope::Pool).unwrap().is_allowed());
        }

        let threads = 16;
        let barrier = Barrier::new(threads);
        let allowed = std::thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        limiter.check(&Scope::Pool).unwrap().is_allowed()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|allowed| *allowed)
                .count()
        });
        assert_eq!(allowed, 1);
    }

    #[test]
    fn decisions_are_counted_in_metrics() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let (_clock, limiter) = limiter(per_minute(1), Ceilings::default());
        limiter.check(&Scope::Pool).unwrap();
        limiter.check(&Scope::Pool).unwrap();

        let output = handle.render();
        assert!(output.contains("quota_decisions_total"), "{output}");
        assert!(output.contains("decision=\"allow\""), "{output}");
        assert!(output.contains("decision=\"deny\""), "{output}");
    }
}

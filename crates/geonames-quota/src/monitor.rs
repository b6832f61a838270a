//! Usage accounting per scope and window
//!
//! The monitor is the single owner of all usage counters. Every read and
//! write goes through one `std::sync::Mutex`, which makes check-and-increment
//! atomic across every scope involved in a decision. The lock is never held
//! across an `.await`, so it is also safe to take from `Drop`.
//!
//! If a thread panics while holding the lock the counters can no longer be
//! trusted. Every later call then fails with `LimiterUnavailable` and callers
//! deny the request.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::limits::Ceilings;
use crate::window::{UsageWindow, Window};

/// What a set of counters is counting for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Pool,
    Credential(String),
}

impl Scope {
    pub fn credential(id: impl Into<String>) -> Self {
        Scope::Credential(id.into())
    }

    /// Metric/log label without the credential id.
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Pool => "pool",
            Scope::Credential(_) => "credential",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Pool => f.write_str("pool"),
            Scope::Credential(id) => write!(f, "credential:{id}"),
        }
    }
}

/// Result of a capacity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// One unit was consumed.
    Allow,
    /// The pool-wide ceiling is reached. Nothing was consumed.
    Deny { retry_after: Duration, window: Window },
    /// This credential is at its ceiling but the pool is not. Nothing was
    /// consumed; another credential may still serve the request.
    Reroute { retry_after: Duration, window: Window },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allow)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitDecision::Allow => None,
            RateLimitDecision::Deny { retry_after, .. }
            | RateLimitDecision::Reroute { retry_after, .. } => Some(*retry_after),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RateLimitDecision::Allow => "allow",
            RateLimitDecision::Deny { .. } => "deny",
            RateLimitDecision::Reroute { .. } => "reroute",
        }
    }
}

/// Utilization of one window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowSnapshot {
    pub window: Window,
    pub count: u64,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub percent_used: Option<f64>,
    pub resets_in_secs: u64,
}

/// Utilization of one scope across all windows.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeSnapshot {
    pub total_requests: u64,
    /// Milliseconds since the Unix epoch.
    pub last_used_at: Option<u64>,
    pub windows: Vec<WindowSnapshot>,
}

impl ScopeSnapshot {
    pub fn window(&self, window: Window) -> Option<&WindowSnapshot> {
        self.windows.iter().find(|w| w.window == window)
    }
}

/// Utilization of the pool and every known credential.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    /// Milliseconds since the Unix epoch.
    pub taken_at: u64,
    pub pool: ScopeSnapshot,
    pub credentials: BTreeMap<String, ScopeSnapshot>,
}

/// Counters and ceilings for one scope.
#[derive(Debug, Clone)]
struct ScopeUsage {
    ceilings: Ceilings,
    windows: [UsageWindow; 4],
    total: u64,
    last_used: Option<u64>,
}

impl ScopeUsage {
    fn new(ceilings: Ceilings, now_millis: u64) -> Self {
        Self {
            ceilings,
            windows: Window::ALL.map(|w| UsageWindow::new(w, now_millis)),
            total: 0,
            last_used: None,
        }
    }

    fn roll(&mut self, now_millis: u64) {
        for w in &mut self.windows {
            w.roll(now_millis);
        }
    }

    /// The saturated window whose reset lies furthest out, if any. Capacity
    /// only returns once every saturated window has reset.
    fn saturated(&self, now_millis: u64) -> Option<(Window, Duration)> {
        self.ceilings
            .iter()
            .filter(|(window, limit)| self.windows[window.index()].count() >= *limit)
            .map(|(window, _)| {
                let resets_at = self.windows[window.index()].resets_at();
                (window, Duration::from_millis(resets_at.saturating_sub(now_millis)))
            })
            .max_by_key(|(_, retry_after)| *retry_after)
    }

    fn record(&mut self, at_millis: u64) {
        for w in &mut self.windows {
            if w.covers(at_millis) {
                w.increment();
            }
        }
        self.total += 1;
        self.last_used = Some(self.last_used.map_or(at_millis, |prev| prev.max(at_millis)));
    }

    /// Count one admitted unit in every current bucket. A caller holding a
    /// timestamp from before the latest roll still lands in the live bucket.
    fn admit(&mut self, now_millis: u64) {
        for w in &mut self.windows {
            w.increment();
        }
        self.total += 1;
        self.last_used = Some(self.last_used.map_or(now_millis, |prev| prev.max(now_millis)));
    }

    fn refund(&mut self, reserved_at: u64) -> bool {
        let mut refunded = false;
        for w in &mut self.windows {
            if w.covers(reserved_at) {
                refunded |= w.decrement();
            }
        }
        if refunded {
            self.total = self.total.saturating_sub(1);
        }
        refunded
    }

    fn snapshot(&self, now_millis: u64) -> ScopeSnapshot {
        let windows = self
            .windows
            .iter()
            .map(|w| {
                let limit = self.ceilings.get(w.window());
                WindowSnapshot {
                    window: w.window(),
                    count: w.count(),
                    limit,
                    remaining: limit.map(|l| l.saturating_sub(w.count())),
                    percent_used: limit.map(|l| w.count() as f64 / l as f64 * 100.0),
                    resets_in_secs: ceil_secs(w.resets_at().saturating_sub(now_millis)),
                }
            })
            .collect();
        ScopeSnapshot {
            total_requests: self.total,
            last_used_at: self.last_used,
            windows,
        }
    }
}

/// Round milliseconds up to whole seconds.
pub(crate) fn ceil_secs(millis: u64) -> u64 {
    millis.div_ceil(1_000)
}

/// Records request counts per scope and answers capacity questions.
pub struct UsageMonitor {
    clock: Arc<dyn Clock>,
    pool_ceilings: Ceilings,
    credential_ceilings: Ceilings,
    state: Mutex<HashMap<Scope, ScopeUsage>>,
}

impl UsageMonitor {
    /// Create a monitor with the pool-wide ceilings and the default ceilings
    /// applied to any credential without an explicit registration.
    pub fn new(clock: Arc<dyn Clock>, pool_ceilings: Ceilings, credential_ceilings: Ceilings) -> Self {
        let now = clock.now_millis();
        let mut state = HashMap::new();
        state.insert(Scope::Pool, ScopeUsage::new(pool_ceilings, now));
        Self {
            clock,
            pool_ceilings,
            credential_ceilings,
            state: Mutex::new(state),
        }
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn pool_ceilings(&self) -> Ceilings {
        self.pool_ceilings
    }

    pub fn default_credential_ceilings(&self) -> Ceilings {
        self.credential_ceilings
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Scope, ScopeUsage>>> {
        self.state.lock().map_err(|_| {
            error!("usage state poisoned, failing closed");
            Error::LimiterUnavailable("usage state poisoned by a panicked writer".into())
        })
    }

    fn default_ceilings(&self, scope: &Scope) -> Ceilings {
        match scope {
            Scope::Pool => self.pool_ceilings,
            Scope::Credential(_) => self.credential_ceilings,
        }
    }

    /// Start tracking a scope with explicit ceilings, or replace the ceilings
    /// of a scope already tracked. Existing counts are kept.
    pub fn register(&self, scope: Scope, ceilings: Ceilings) -> Result<()> {
        ceilings.validate()?;
        let now = self.now_millis();
        let mut state = self.lock()?;
        state
            .entry(scope)
            .and_modify(|usage| usage.ceilings = ceilings)
            .or_insert_with(|| ScopeUsage::new(ceilings, now));
        Ok(())
    }

    /// Stop tracking a scope once none of its windows still holds a count.
    /// A scope with live usage is kept so that re-registering the same id
    /// resumes from the counts the provider still holds. The pool scope is
    /// never forgotten. Returns whether the scope was dropped.
    pub fn forget(&self, scope: &Scope) -> Result<bool> {
        if *scope == Scope::Pool {
            return Ok(false);
        }
        let mut state = self.lock()?;
        let now = self.now_millis();
        let idle = match state.get_mut(scope) {
            Some(usage) => {
                usage.roll(now);
                usage.windows.iter().all(|w| w.count() == 0)
            }
            None => return Ok(false),
        };
        if idle {
            state.remove(scope);
        }
        Ok(idle)
    }

    /// Ceilings in effect for a scope.
    pub fn ceilings_for(&self, scope: &Scope) -> Result<Ceilings> {
        let state = self.lock()?;
        Ok(state
            .get(scope)
            .map(|usage| usage.ceilings)
            .unwrap_or_else(|| self.default_ceilings(scope)))
    }

    /// Count one request made with `credential_id` at `at_millis` against
    /// that credential and the pool, without checking ceilings.
    ///
    /// Used for usage the limiter did not admit itself. A timestamp from a
    /// bucket that has already passed only moves the totals. A timestamp
    /// ahead of the local clock is counted now and never rolls a window.
    pub fn record(&self, credential_id: &str, at_millis: u64) -> Result<()> {
        let mut state = self.lock()?;
        let now = self.now_millis();
        let at_millis = at_millis.min(now);
        for scope in [Scope::credential(credential_id), Scope::Pool] {
            let ceilings = self.default_ceilings(&scope);
            let usage = state
                .entry(scope)
                .or_insert_with(|| ScopeUsage::new(ceilings, now));
            usage.roll(now);
            usage.record(at_millis);
        }
        Ok(())
    }

    /// Check every scope against its ceilings and, only if all have room,
    /// count one unit against each of them. All in one critical section.
    ///
    /// A saturated pool scope yields `Deny`; a saturated credential scope
    /// yields `Reroute`. The pool verdict wins when both are saturated.
    pub fn try_consume(&self, scopes: &[Scope], now_millis: u64) -> Result<RateLimitDecision> {
        let mut state = self.lock()?;

        let mut pool_denial = None;
        let mut credential_denial = None;
        for scope in scopes {
            let ceilings = self.default_ceilings(scope);
            let usage = state
                .entry(scope.clone())
                .or_insert_with(|| ScopeUsage::new(ceilings, now_millis));
            usage.roll(now_millis);
            if let Some((window, retry_after)) = usage.saturated(now_millis) {
                match scope {
                    Scope::Pool => pool_denial = Some((window, retry_after)),
                    Scope::Credential(_) => {
                        credential_denial = match credential_denial {
                            Some((_, prev)) if prev >= retry_after => credential_denial,
                            _ => Some((window, retry_after)),
                        }
                    }
                }
            }
        }

        if let Some((window, retry_after)) = pool_denial {
            return Ok(RateLimitDecision::Deny { retry_after, window });
        }
        if let Some((window, retry_after)) = credential_denial {
            return Ok(RateLimitDecision::Reroute { retry_after, window });
        }

        for scope in scopes {
            if let Some(usage) = state.get_mut(scope) {
                usage.admit(now_millis);
            }
        }
        Ok(RateLimitDecision::Allow)
    }

    /// Give back one unit counted at `reserved_at` in each scope. Windows
    /// that have rolled over since are left alone.
    pub fn refund(&self, scopes: &[Scope], reserved_at: u64) -> Result<()> {
        let mut state = self.lock()?;
        let now = self.now_millis();
        for scope in scopes {
            if let Some(usage) = state.get_mut(scope) {
                usage.roll(now);
                if usage.refund(reserved_at) {
                    debug!(scope = %scope, "refunded reserved unit");
                }
            }
        }
        Ok(())
    }

    /// If a scope has hit a ceiling, the instant (ms since epoch) at which
    /// every saturated window will have reset.
    pub fn saturated_until(&self, scope: &Scope, now_millis: u64) -> Result<Option<u64>> {
        let mut state = self.lock()?;
        Ok(state.get_mut(scope).and_then(|usage| {
            usage.roll(now_millis);
            usage
                .saturated(now_millis)
                .map(|(_, retry_after)| now_millis + retry_after.as_millis() as u64)
        }))
    }

    /// Utilization of a single scope. Unknown scopes report zero usage.
    pub fn scope_snapshot(&self, scope: &Scope) -> Result<ScopeSnapshot> {
        let now = self.now_millis();
        let mut state = self.lock()?;
        Ok(match state.get_mut(scope) {
            Some(usage) => {
                usage.roll(now);
                usage.snapshot(now)
            }
            None => ScopeUsage::new(self.default_ceilings(scope), now).snapshot(now),
        })
    }

    /// Utilization of the pool and every tracked credential.
    pub fn snapshot(&self) -> Result<UsageSnapshot> {
        let now = self.now_millis();
        let mut state = self.lock()?;

        let mut pool = None;
        let mut credentials = BTreeMap::new();
        for (scope, usage) in state.iter_mut() {
            usage.roll(now);
            match scope {
                Scope::Pool => pool = Some(usage.snapshot(now)),
                Scope::Credential(id) => {
                    credentials.insert(id.clone(), usage.snapshot(now));
                }
            }
        }

        Ok(UsageSnapshot {
            taken_at: now,
            pool: pool.unwrap_or_else(|| ScopeUsage::new(self.pool_ceilings, now).snapshot(now)),
            credentials,
        })
    }
}

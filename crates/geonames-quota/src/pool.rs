//! Credential pool with round-robin selection
//!
//! The pool holds an ordered list of credentials and a round-robin index
//! into it. Selection skips suspended credentials and exhausted credentials
//! whose reset time has not arrived; an exhausted credential whose reset time
//! has passed goes back to Active on the spot, without a background task.
//!
//! Every successful selection reserves one unit against the credential and
//! the pool through the rate limiter. The usage monitor is the authority on
//! counts; the status kept here is how the pool remembers which credentials
//! to skip.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::classify::{Outcome, ProviderFailure};
use crate::credential::{Credential, CredentialStatus};
use crate::error::{Error, Result};
use crate::lease::CredentialLease;
use crate::limiter::RateLimiter;
use crate::limits::Ceilings;
use crate::monitor::{RateLimitDecision, Scope, ScopeSnapshot, UsageMonitor, ceil_secs};

/// Pool behavior knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Consecutive provider auth rejections before a credential is suspended.
    pub auth_failure_threshold: u32,
    /// How long a credential stays exhausted when the provider reports quota
    /// exhaustion without saying which window ran out.
    pub quota_cooldown: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            auth_failure_threshold: 2,
            quota_cooldown: Duration::from_secs(3600),
        }
    }
}

/// Overall pool health for the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealth {
    /// Every credential usable.
    Healthy,
    /// Some credentials usable.
    Degraded,
    /// No credential usable (or no credentials at all).
    Unhealthy,
}

/// Status and usage of one pooled credential. Never carries the username.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSnapshot {
    pub id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exhausted_for_secs: Option<u64>,
    pub consecutive_failures: u32,
    pub usage: ScopeSnapshot,
}

/// Pool status and utilization for status/health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub status: PoolHealth,
    pub credentials_total: usize,
    pub credentials_available: usize,
    pub credentials_exhausted: usize,
    pub credentials_suspended: usize,
    /// Milliseconds since the Unix epoch.
    pub taken_at: u64,
    pub pool: ScopeSnapshot,
    pub credentials: Vec<CredentialSnapshot>,
}

#[derive(Debug)]
struct PoolEntry {
    credential: Credential,
    status: CredentialStatus,
    consecutive_failures: u32,
}

impl PoolEntry {
    fn new(credential: Credential) -> Self {
        Self {
            credential,
            status: CredentialStatus::Active,
            consecutive_failures: 0,
        }
    }

    fn transition(&mut self, status: CredentialStatus) {
        if self.status.label() != status.label() {
            metrics::counter!("credential_transitions_total", "to" => status.label()).increment(1);
        }
        self.status = status;
    }
}

/// Counts by status at a point in time. Exhausted credentials whose reset
/// has passed count as available.
#[derive(Debug, Default)]
struct StatusCounts {
    available: usize,
    exhausted: usize,
    suspended: usize,
    /// Earliest pending reset among exhausted credentials (ms since epoch).
    next_reset: Option<u64>,
}

fn count_statuses(entries: &[PoolEntry], now_millis: u64) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for entry in entries {
        match entry.status {
            CredentialStatus::Suspended => counts.suspended += 1,
            CredentialStatus::Exhausted { until } if until > now_millis => {
                counts.exhausted += 1;
                counts.next_reset = Some(counts.next_reset.map_or(until, |r| r.min(until)));
            }
            _ => counts.available += 1,
        }
    }
    counts
}

/// Credential pool manager.
///
/// `RwLock` guards the ordered credential list and statuses; an `AtomicUsize`
/// drives round-robin. Usage counters live in the shared `UsageMonitor`.
pub struct Pool {
    entries: RwLock<Vec<PoolEntry>>,
    next_index: AtomicUsize,
    limiter: RateLimiter,
    config: PoolConfig,
}

impl Pool {
    /// Create a pool over `credentials`, in rotation order.
    ///
    /// Credentials without ceilings registered on the monitor get the
    /// monitor's default credential ceilings. Duplicate ids are rejected.
    pub fn new(
        credentials: Vec<Credential>,
        monitor: Arc<UsageMonitor>,
        config: PoolConfig,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for credential in &credentials {
            if !seen.insert(credential.id.clone()) {
                return Err(Error::Duplicate(credential.id.clone()));
            }
            let scope = Scope::credential(credential.id.as_str());
            let ceilings = monitor.ceilings_for(&scope)?;
            monitor.register(scope, ceilings)?;
        }

        info!(credentials = credentials.len(), "credential pool initialized");
        Ok(Self {
            entries: RwLock::new(credentials.into_iter().map(PoolEntry::new).collect()),
            next_index: AtomicUsize::new(0),
            limiter: RateLimiter::new(monitor),
            config,
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn monitor(&self) -> &Arc<UsageMonitor> {
        self.limiter.monitor()
    }

    /// Check out the next usable credential, round-robin.
    pub async fn acquire(&self) -> Result<CredentialLease> {
        self.acquire_excluding(&HashSet::new()).await
    }

    /// Check out the next usable credential whose id is not in `exclude`.
    ///
    /// Scans every credential once starting from the round-robin index.
    /// A credential at its own ceiling is marked exhausted until its window
    /// resets and the scan moves on. A pool at its aggregate ceiling ends the
    /// scan immediately: no credential could help.
    ///
    /// Returns `PoolExhausted` with a retry hint when nothing is usable, and
    /// `LimiterUnavailable` when accounting is broken (fail closed).
    pub async fn acquire_excluding(&self, exclude: &HashSet<String>) -> Result<CredentialLease> {
        let monitor = self.limiter.monitor();
        let mut entries = self.entries.write().await;
        let now = monitor.now_millis();
        let n = entries.len();

        if n > 0 {
            let start = self.next_index.load(Ordering::Relaxed) % n;

            for offset in 0..n {
                let index = (start + offset) % n;
                let entry = &mut entries[index];
                if exclude.contains(&entry.credential.id) {
                    continue;
                }

                match entry.status {
                    CredentialStatus::Active => {}
                    CredentialStatus::Exhausted { until } if now >= until => {
                        info!(
                            credential_id = entry.credential.id,
                            "quota window reset, credential active again"
                        );
                        entry.transition(CredentialStatus::Active);
                    }
                    CredentialStatus::Exhausted { .. } | CredentialStatus::Suspended => continue,
                }

                let scope = Scope::credential(entry.credential.id.as_str());
                match self.limiter.check_at(&scope, now)? {
                    RateLimitDecision::Allow => {
                        if let Some(until) = monitor.saturated_until(&scope, now)? {
                            info!(
                                credential_id = entry.credential.id,
                                resets_in_secs = ceil_secs(until - now),
                                "credential reached its ceiling, marking exhausted"
                            );
                            entry.transition(CredentialStatus::Exhausted { until });
                        }
                        // Rotation continues after the credential handed out.
                        self.next_index.store(index + 1, Ordering::Relaxed);
                        debug!(credential_id = entry.credential.id, "credential acquired");
                        return Ok(CredentialLease::new(
                            entry.credential.clone(),
                            now,
                            monitor.clone(),
                        ));
                    }
                    RateLimitDecision::Reroute { retry_after, .. } => {
                        let until = now + retry_after.as_millis() as u64;
                        info!(
                            credential_id = entry.credential.id,
                            resets_in_secs = ceil_secs(until - now),
                            "credential at ceiling, rotating"
                        );
                        entry.transition(CredentialStatus::Exhausted { until });
                    }
                    RateLimitDecision::Deny { retry_after, .. } => {
                        let counts = count_statuses(&entries, now);
                        return Err(Error::PoolExhausted {
                            retry_after: Some(retry_after),
                            total: n,
                            exhausted: counts.exhausted,
                            suspended: counts.suspended,
                        });
                    }
                }
            }
        }

        let counts = count_statuses(&entries, now);
        let retry_after = counts
            .next_reset
            .map(|reset| Duration::from_millis(reset.saturating_sub(now)));
        warn!(
            total = n,
            exhausted = counts.exhausted,
            suspended = counts.suspended,
            retry_after_secs = retry_after.map(|d| ceil_secs(d.as_millis() as u64)),
            "credential pool exhausted"
        );
        Err(Error::PoolExhausted {
            retry_after,
            total: n,
            exhausted: counts.exhausted,
            suspended: counts.suspended,
        })
    }

    /// Report how the call made with `lease` went.
    ///
    /// - Success → consecutive failure count reset
    /// - AuthRejected → failure counted; suspended at the threshold
    /// - QuotaExceeded → exhausted until the reported window resets
    /// - Transient → no change
    /// - Abandoned → the reserved unit is refunded
    pub async fn release(&self, mut lease: CredentialLease, outcome: Outcome) -> Result<()> {
        if outcome == Outcome::Abandoned {
            lease.refund()?;
        } else {
            lease.mark_settled();
        }

        let now = self.limiter.monitor().now_millis();
        let mut entries = self.entries.write().await;
        let Some(entry) = entries
            .iter_mut()
            .find(|e| e.credential.id == lease.credential_id())
        else {
            debug!(
                credential_id = lease.credential_id(),
                "released lease for a credential no longer in the pool"
            );
            return Ok(());
        };

        match outcome {
            Outcome::Success => entry.consecutive_failures = 0,
            Outcome::Abandoned => {
                debug!(credential_id = entry.credential.id, "lease abandoned, unit refunded")
            }
            Outcome::Failed(ProviderFailure::AuthRejected(message)) => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.config.auth_failure_threshold {
                    warn!(
                        credential_id = entry.credential.id,
                        failures = entry.consecutive_failures,
                        error = %message,
                        "credential suspended after repeated auth rejections"
                    );
                    entry.transition(CredentialStatus::Suspended);
                } else {
                    warn!(
                        credential_id = entry.credential.id,
                        failures = entry.consecutive_failures,
                        error = %message,
                        "provider rejected credential"
                    );
                }
            }
            Outcome::Failed(ProviderFailure::QuotaExceeded { window, message }) => {
                let until = match window {
                    Some(window) => window.resets_at(now),
                    None => now + self.config.quota_cooldown.as_millis() as u64,
                };
                info!(
                    credential_id = entry.credential.id,
                    resets_in_secs = ceil_secs(until - now),
                    error = %message,
                    "provider reported quota exhausted"
                );
                entry.transition(CredentialStatus::Exhausted { until });
            }
            Outcome::Failed(ProviderFailure::Transient(message)) => {
                debug!(credential_id = entry.credential.id, error = %message, "transient provider failure, no pool action");
            }
        }
        Ok(())
    }

    /// Run one provider call with a pooled credential, rotating on rejection.
    ///
    /// An auth rejection or quota exhaustion is reported to the pool and the
    /// call is retried with a credential not yet tried in this invocation. A
    /// transient failure is returned as `Upstream` without retrying. If every
    /// credential was tried and the last rejection was an auth failure, the
    /// result is `ProviderAuthFailure`.
    pub async fn with_credential<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderFailure>>,
    {
        let mut tried = HashSet::new();
        let mut last_auth_failure: Option<(String, String)> = None;

        loop {
            let lease = match self.acquire_excluding(&tried).await {
                Ok(lease) => lease,
                Err(err @ Error::PoolExhausted { .. }) => {
                    return Err(match last_auth_failure {
                        Some((credential_id, message)) => Error::ProviderAuthFailure {
                            credential_id,
                            message,
                        },
                        None => err,
                    });
                }
                Err(e) => return Err(e),
            };

            let credential = lease.credential().clone();
            match call(credential.clone()).await {
                Ok(value) => {
                    self.release(lease, Outcome::Success).await?;
                    return Ok(value);
                }
                Err(failure) => {
                    self.release(lease, Outcome::Failed(failure.clone())).await?;
                    match failure {
                        ProviderFailure::AuthRejected(message) => {
                            warn!(
                                credential_id = credential.id,
                                "retrying with another credential after auth rejection"
                            );
                            last_auth_failure = Some((credential.id.clone(), message));
                            tried.insert(credential.id);
                        }
                        ProviderFailure::QuotaExceeded { .. } => {
                            debug!(
                                credential_id = credential.id,
                                "retrying with another credential after quota rejection"
                            );
                            tried.insert(credential.id);
                        }
                        ProviderFailure::Transient(message) => {
                            return Err(Error::Upstream(message));
                        }
                    }
                }
            }
        }
    }

    /// Add a credential at the end of the rotation. Starts Active.
    pub async fn add_credential(&self, credential: Credential, ceilings: Option<Ceilings>) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.iter().any(|e| e.credential.id == credential.id) {
            return Err(Error::Duplicate(credential.id));
        }
        let monitor = self.limiter.monitor();
        let scope = Scope::credential(credential.id.as_str());
        let ceilings = match ceilings {
            Some(c) => c,
            None => monitor.ceilings_for(&scope)?,
        };
        monitor.register(scope, ceilings)?;

        info!(credential_id = credential.id, "credential added to pool");
        entries.push(PoolEntry::new(credential));
        Ok(())
    }

    /// Remove a credential from the rotation.
    ///
    /// Its usage is dropped only if nothing is counted in any current window.
    /// Otherwise the counters stay, and adding the same id again picks up
    /// where the provider's own accounting is.
    pub async fn remove_credential(&self, credential_id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.credential.id != credential_id);
        if entries.len() == before {
            return Err(Error::NotFound(credential_id.to_string()));
        }
        let forgotten = self
            .limiter
            .monitor()
            .forget(&Scope::credential(credential_id))?;
        info!(credential_id, usage_kept = !forgotten, "credential removed from pool");
        Ok(())
    }

    /// Return a suspended or exhausted credential to Active and clear its
    /// failure count. Usage counters are untouched, so a credential still at
    /// its ceiling is re-marked exhausted on the next selection.
    pub async fn reinstate(&self, credential_id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.credential.id == credential_id)
            .ok_or_else(|| Error::NotFound(credential_id.to_string()))?;
        entry.consecutive_failures = 0;
        entry.transition(CredentialStatus::Active);
        info!(credential_id, "credential reinstated");
        Ok(())
    }

    /// Credential ids in rotation order.
    pub async fn credential_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| e.credential.id.clone())
            .collect()
    }

    pub async fn status_of(&self, credential_id: &str) -> Option<CredentialStatus> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.credential.id == credential_id)
            .map(|e| e.status)
    }

    /// Pool status and utilization.
    ///
    /// Health: every credential usable → healthy, some → degraded,
    /// none (or an empty pool) → unhealthy.
    pub async fn snapshot(&self) -> Result<PoolSnapshot> {
        let entries = self.entries.read().await;
        let usage = self.limiter.monitor().snapshot()?;
        let now = usage.taken_at;
        let counts = count_statuses(&entries, now);

        let credentials = entries
            .iter()
            .map(|entry| {
                let usable = entry.status.is_usable(now);
                let exhausted_for_secs = match entry.status {
                    CredentialStatus::Exhausted { until } if !usable => Some(ceil_secs(until - now)),
                    _ => None,
                };
                CredentialSnapshot {
                    id: entry.credential.id.clone(),
                    status: if usable {
                        CredentialStatus::Active.label()
                    } else {
                        entry.status.label()
                    },
                    exhausted_for_secs,
                    consecutive_failures: entry.consecutive_failures,
                    usage: usage
                        .credentials
                        .get(&entry.credential.id)
                        .cloned()
                        .unwrap_or_else(|| ScopeSnapshot {
                            total_requests: 0,
                            last_used_at: None,
                            windows: Vec::new(),
                        }),
                }
            })
            .collect();

        let total = entries.len();
        let status = if total > 0 && counts.available == total {
            PoolHealth::Healthy
        } else if counts.available > 0 {
            PoolHealth::Degraded
        } else {
            PoolHealth::Unhealthy
        };

        metrics::gauge!("pool_credentials", "status" => "available").set(counts.available as f64);
        metrics::gauge!("pool_credentials", "status" => "exhausted").set(counts.exhausted as f64);
        metrics::gauge!("pool_credentials", "status" => "suspended").set(counts.suspended as f64);

        Ok(PoolSnapshot {
            status,
            credentials_total: total,
            credentials_available: counts.available,
            credentials_exhausted: counts.exhausted,
            credentials_suspended: counts.suspended,
            taken_at: now,
            pool: usage.pool,
            credentials,
        })
    }
}

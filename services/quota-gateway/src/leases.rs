//! Leases held on behalf of HTTP clients
//!
//! A client checks out a credential with `POST /v1/leases` and reports the
//! outcome with `POST /v1/leases/{id}/release`. Between the two the lease
//! lives here. Every table operation first drops leases older than the TTL.
//! An expired lease keeps its unit counted: the client may have made the
//! call and simply never reported back. Only an explicit `abandoned` release
//! refunds.

use std::collections::HashMap;
use std::time::Duration;

use geonames_quota::CredentialLease;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::metrics;

struct HeldLease {
    lease: CredentialLease,
    expires_at: Instant,
}

/// Outstanding leases keyed by lease id.
pub struct LeaseTable {
    leases: Mutex<HashMap<String, HeldLease>>,
    ttl: Duration,
}

impl LeaseTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Hold a lease until it is taken back or expires.
    pub async fn insert(&self, lease: CredentialLease) {
        let mut leases = self.leases.lock().await;
        purge_expired(&mut leases);
        leases.insert(
            lease.id().to_string(),
            HeldLease {
                lease,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Remove and return a live lease. Expired leases are gone already.
    pub async fn take(&self, lease_id: &str) -> Option<CredentialLease> {
        let mut leases = self.leases.lock().await;
        purge_expired(&mut leases);
        leases.remove(lease_id).map(|held| held.lease)
    }

    /// Number of live leases.
    pub async fn len(&self) -> usize {
        let mut leases = self.leases.lock().await;
        purge_expired(&mut leases);
        leases.len()
    }
}

fn purge_expired(leases: &mut HashMap<String, HeldLease>) {
    let now = Instant::now();
    leases.retain(|lease_id, held| {
        if held.expires_at > now {
            return true;
        }
        warn!(
            lease_id,
            credential_id = held.lease.credential_id(),
            "lease expired unreleased, unit stays counted"
        );
        held.lease.expire();
        metrics::record_lease("expired");
        false
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use geonames_quota::{Ceilings, Credential, ManualClock, Pool, PoolConfig, UsageMonitor};
    use std::sync::Arc;

    fn pool() -> Pool {
        let monitor = Arc::new(UsageMonitor::new(
            Arc::new(ManualClock::new(1_767_225_600_000)),
            Ceilings {
                per_minute: Some(1),
                ..Ceilings::default()
            },
            Ceilings::default(),
        ));
        Pool::new(
            vec![Credential::new("a", "user_a")],
            monitor,
            PoolConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn take_returns_lease_once() {
        let pool = pool();
        let table = LeaseTable::new(Duration::from_secs(60));
        let lease = pool.acquire().await.unwrap();
        let id = lease.id().to_string();
        table.insert(lease).await;

        assert_eq!(table.len().await, 1);
        let lease = table.take(&id).await.unwrap();
        assert_eq!(lease.credential_id(), "a");
        assert!(table.take(&id).await.is_none());
        pool.release(lease, geonames_quota::Outcome::Success)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_keeps_unit_counted() {
        let pool = pool();
        let table = LeaseTable::new(Duration::from_secs(60));
        let lease = pool.acquire().await.unwrap();
        let id = lease.id().to_string();
        table.insert(lease).await;

        // The pool ceiling of 1/min is used up by the held lease.
        assert!(pool.acquire().await.is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(table.take(&id).await.is_none());
        assert_eq!(table.len().await, 0);

        // The holder may have used the credential, so nothing came back.
        assert!(pool.acquire().await.is_err());
        let usage = pool.monitor().snapshot().unwrap();
        assert_eq!(usage.pool.total_requests, 1);
        assert_eq!(usage.credentials["a"].total_requests, 1);
    }
}

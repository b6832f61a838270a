//! Checked-out credentials
//!
//! A lease holds one unit reserved against its credential and the pool.
//! Handing it back through `Pool::release` settles it. A lease that is
//! dropped unsettled (the caller gave up, the task was cancelled) gives its
//! unit back on a best-effort basis. A lease whose holder went silent is
//! `expire`d instead: the call may have been made, so the unit stays.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::credential::Credential;
use crate::error::Result;
use crate::monitor::{Scope, UsageMonitor};

/// A credential checked out for one provider call.
pub struct CredentialLease {
    id: String,
    credential: Credential,
    reserved_at: u64,
    monitor: Arc<UsageMonitor>,
    settled: bool,
}

impl CredentialLease {
    pub(crate) fn new(credential: Credential, reserved_at: u64, monitor: Arc<UsageMonitor>) -> Self {
        Self {
            id: format!("lease_{}", uuid::Uuid::new_v4().as_simple()),
            credential,
            reserved_at,
            monitor,
            settled: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn credential_id(&self) -> &str {
        &self.credential.id
    }

    /// The provider username to send with the call.
    pub fn username(&self) -> &str {
        self.credential.username.expose()
    }

    /// When the unit was reserved (ms since epoch).
    pub fn reserved_at(&self) -> u64 {
        self.reserved_at
    }

    /// The unit was used; keep it counted.
    pub(crate) fn mark_settled(&mut self) {
        self.settled = true;
    }

    /// Settle a lease that was never reported on. The unit stays counted.
    pub fn expire(&mut self) {
        self.settled = true;
    }

    /// Give the reserved unit back. Settles the lease even if the refund fails.
    pub(crate) fn refund(&mut self) -> Result<()> {
        self.settled = true;
        self.monitor.refund(
            &[Scope::credential(self.credential.id.as_str()), Scope::Pool],
            self.reserved_at,
        )
    }
}

impl std::fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialLease")
            .field("id", &self.id)
            .field("credential_id", &self.credential.id)
            .field("reserved_at", &self.reserved_at)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let lease_id = self.id.clone();
        let credential_id = self.credential.id.clone();
        match self.refund() {
            Ok(()) => debug!(lease_id, credential_id, "lease dropped unreleased, unit refunded"),
            Err(e) => warn!(lease_id, credential_id, error = %e, "lease refund failed"),
        }
    }
}

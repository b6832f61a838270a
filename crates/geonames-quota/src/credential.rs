//! Provider credentials and their pool status

use common::Secret;

/// A provider account. The username is the token Geonames authenticates by,
/// so it is kept in a `Secret` and never printed.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub username: Secret<String>,
}

impl Credential {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: Secret::new(username.into()),
        }
    }
}

/// Runtime status of a pooled credential.
///
/// Transitions:
/// - Active → Exhausted (a window ceiling reached, or provider reported quota)
/// - Active → Suspended (repeated provider auth rejections)
/// - Exhausted → Active (reset time passed, checked lazily on selection)
/// - Suspended/Exhausted → Active (admin reinstate)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Active,
    /// Unusable until `until` (ms since epoch).
    Exhausted { until: u64 },
    Suspended,
}

impl CredentialStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Exhausted { .. } => "exhausted",
            CredentialStatus::Suspended => "suspended",
        }
    }

    /// Whether a credential in this status may be selected at `now_millis`.
    pub fn is_usable(&self, now_millis: u64) -> bool {
        match self {
            CredentialStatus::Active => true,
            CredentialStatus::Exhausted { until } => now_millis >= *until,
            CredentialStatus::Suspended => false,
        }
    }
}

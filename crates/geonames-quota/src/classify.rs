//! Classification of provider responses into credential outcomes
//!
//! Geonames reports most failures as HTTP 200 with a body like
//! `{"status": {"message": "...", "value": 19}}`. The status code decides
//! what happens to the credential that made the call:
//!
//! - 10 (authorization exception, account not enabled) → `AuthRejected`
//! - 18 / 19 / 20 (daily / hourly / weekly credits exceeded) → `QuotaExceeded`
//! - 13 (database timeout), 22 (server overloaded) → `Transient`
//! - anything else, including "no result found", means the credential worked

use serde::Deserialize;

use crate::window::Window;

/// Why a provider call failed, from the credential's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderFailure {
    /// The provider rejected the credential itself.
    AuthRejected(String),
    /// The credential ran out of provider-side quota. `window` is the
    /// provider window that ran out, when known.
    QuotaExceeded {
        window: Option<Window>,
        message: String,
    },
    /// Provider trouble unrelated to the credential.
    Transient(String),
}

impl ProviderFailure {
    pub fn label(&self) -> &'static str {
        match self {
            ProviderFailure::AuthRejected(_) => "auth_rejected",
            ProviderFailure::QuotaExceeded { .. } => "quota_exceeded",
            ProviderFailure::Transient(_) => "transient",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ProviderFailure::AuthRejected(m)
            | ProviderFailure::QuotaExceeded { message: m, .. }
            | ProviderFailure::Transient(m) => m,
        }
    }
}

/// What happened to a leased credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed(ProviderFailure),
    /// The call never went out. The reserved unit is given back.
    Abandoned,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failed(failure) => failure.label(),
            Outcome::Abandoned => "abandoned",
        }
    }
}

/// Message fragments that mark quota exhaustion when no status code is present.
const QUOTA_PATTERNS: &[&str] = &[
    "limit of",
    "credits",
    "limit exceeded",
    "has been exceeded",
];

/// Message fragments that mark a rejected account.
const AUTH_PATTERNS: &[&str] = &[
    "user account not enabled",
    "invalid user",
    "user does not exist",
    "authorization exception",
];

#[derive(Deserialize)]
struct StatusEnvelope {
    status: ProviderStatus,
}

#[derive(Deserialize)]
struct ProviderStatus {
    #[serde(default)]
    message: String,
    #[serde(default)]
    value: Option<u32>,
}

/// Classify a provider response body.
pub fn classify_body(body: &str) -> Outcome {
    let Ok(envelope) = serde_json::from_str::<StatusEnvelope>(body) else {
        return Outcome::Success;
    };
    let message = envelope.status.message;

    let failure = match envelope.status.value {
        Some(10) => ProviderFailure::AuthRejected(message),
        Some(18) => ProviderFailure::QuotaExceeded {
            window: Some(Window::Day),
            message,
        },
        Some(19) => ProviderFailure::QuotaExceeded {
            window: Some(Window::Hour),
            message,
        },
        Some(20) => ProviderFailure::QuotaExceeded {
            window: None,
            message,
        },
        Some(13) | Some(22) => ProviderFailure::Transient(message),
        Some(_) => return Outcome::Success,
        None => return classify_message(message),
    };
    Outcome::Failed(failure)
}

/// Classify a status message without a code.
fn classify_message(message: String) -> Outcome {
    let lower = message.to_lowercase();
    if AUTH_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Outcome::Failed(ProviderFailure::AuthRejected(message));
    }
    if QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
        let window = if lower.contains("hourly") {
            Some(Window::Hour)
        } else if lower.contains("daily") {
            Some(Window::Day)
        } else {
            None
        };
        return Outcome::Failed(ProviderFailure::QuotaExceeded { window, message });
    }
    Outcome::Success
}

/// Classify a provider response by HTTP status and body.
///
/// 401/403 are rejected credentials, 429 is quota exhaustion, 408/5xx are
/// transient. 2xx defers to `classify_body`. Other 4xx are the caller's
/// fault, not the credential's, so they count as `Success`.
pub fn classify_status(status: u16, body: &str) -> Outcome {
    match status {
        200..=299 => classify_body(body),
        401 | 403 => Outcome::Failed(ProviderFailure::AuthRejected(format!(
            "provider returned {status}"
        ))),
        429 => match classify_body(body) {
            Outcome::Failed(failure @ ProviderFailure::QuotaExceeded { .. }) => {
                Outcome::Failed(failure)
            }
            _ => Outcome::Failed(ProviderFailure::QuotaExceeded {
                window: None,
                message: format!("provider returned {status}"),
            }),
        },
        408 | 500..=599 => Outcome::Failed(ProviderFailure::Transient(format!(
            "provider returned {status}"
        ))),
        _ => Outcome::Success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_body(value: u32, message: &str) -> String {
        serde_json::json!({"status": {"message": message, "value": value}}).to_string()
    }

    #[test]
    fn code_10_is_auth_rejected() {
        let body = status_body(10, "user account not enabled to use the free webservice");
        assert_eq!(
            classify_body(&body),
            Outcome::Failed(ProviderFailure::AuthRejected(
                "user account not enabled to use the free webservice".into()
            ))
        );
    }

    #[test]
    fn code_19_is_hourly_quota() {
        let body = status_body(19, "the hourly limit of 1000 credits for demo has been exceeded");
        match classify_body(&body) {
            Outcome::Failed(ProviderFailure::QuotaExceeded { window, .. }) => {
                assert_eq!(window, Some(Window::Hour))
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn code_18_is_daily_quota() {
        let body = status_body(18, "the daily limit of 20000 credits has been exceeded");
        match classify_body(&body) {
            Outcome::Failed(ProviderFailure::QuotaExceeded { window, .. }) => {
                assert_eq!(window, Some(Window::Day))
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn code_20_is_quota_without_window() {
        let body = status_body(20, "the weekly limit has been exceeded");
        match classify_body(&body) {
            Outcome::Failed(ProviderFailure::QuotaExceeded { window, .. }) => {
                assert_eq!(window, None)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn overload_codes_are_transient() {
        for code in [13, 22] {
            let outcome = classify_body(&status_body(code, "busy"));
            assert_eq!(outcome.label(), "transient", "code {code}");
        }
    }

    #[test]
    fn no_result_found_is_success() {
        assert_eq!(classify_body(&status_body(15, "no result found")), Outcome::Success);
    }

    #[test]
    fn regular_payload_is_success() {
        let body = r#"{"totalResultsCount": 1, "geonames": [{"name": "Recife"}]}"#;
        assert_eq!(classify_body(body), Outcome::Success);
    }

    #[test]
    fn non_json_body_is_success() {
        assert_eq!(classify_body("<html>ok</html>"), Outcome::Success);
        assert_eq!(classify_body(""), Outcome::Success);
    }

    #[test]
    fn message_without_code_uses_patterns() {
        let body = r#"{"status": {"message": "Invalid user"}}"#;
        assert_eq!(classify_body(body).label(), "auth_rejected");

        let body = r#"{"status": {"message": "The DAILY limit of 20000 credits has been exceeded"}}"#;
        match classify_body(body) {
            Outcome::Failed(ProviderFailure::QuotaExceeded { window, .. }) => {
                assert_eq!(window, Some(Window::Day))
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_status_401_403_auth() {
        assert_eq!(classify_status(401, "").label(), "auth_rejected");
        assert_eq!(classify_status(403, "forbidden").label(), "auth_rejected");
    }

    #[test]
    fn classify_status_429_keeps_body_window() {
        let body = status_body(19, "hourly limit");
        match classify_status(429, &body) {
            Outcome::Failed(ProviderFailure::QuotaExceeded { window, .. }) => {
                assert_eq!(window, Some(Window::Hour))
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(classify_status(429, "slow down").label(), "quota_exceeded");
    }

    #[test]
    fn classify_status_server_errors_transient() {
        for status in [408, 500, 502, 503, 504] {
            assert_eq!(classify_status(status, "").label(), "transient", "status {status}");
        }
    }

    #[test]
    fn classify_status_other_4xx_success() {
        assert_eq!(classify_status(400, "bad lat"), Outcome::Success);
        assert_eq!(classify_status(404, ""), Outcome::Success);
    }

    #[test]
    fn classify_status_200_delegates_to_body() {
        let body = status_body(10, "user does not exist.");
        assert_eq!(classify_status(200, &body).label(), "auth_rejected");
    }
}

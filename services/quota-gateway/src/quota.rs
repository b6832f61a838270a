//! Quota and lease endpoints
//!
//! - `GET  /v1/quota/status`              usage per window, pool and credentials
//! - `POST /v1/quota/check`               admit one unit without a lease
//! - `POST /v1/leases`                    check out a credential
//! - `POST /v1/leases/{lease_id}/release` report the outcome of the call

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use geonames_quota::{
    Outcome, Pool, ProviderFailure, RateLimitDecision, Scope, Window, classify_body,
    classify_status,
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{ApiError, retry_after_secs};
use crate::leases::LeaseTable;
use crate::metrics;

/// State shared by the quota handlers.
#[derive(Clone)]
pub struct QuotaState {
    pub pool: Arc<Pool>,
    pub leases: Arc<LeaseTable>,
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// GET /v1/quota/status
pub async fn status_handler(State(state): State<QuotaState>) -> Result<Response, ApiError> {
    let usage = state.pool.monitor().snapshot()?;
    Ok(axum::Json(usage).into_response())
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ScopeKind {
    Pool,
    Credential,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckRequest {
    scope: ScopeKind,
    #[serde(default)]
    credential_id: Option<String>,
}

/// POST /v1/quota/check
///
/// 200 when a unit was admitted, 429 with `Retry-After` when the scope is at
/// its ceiling. A credential check also counts against the pool.
pub async fn check_handler(
    State(state): State<QuotaState>,
    body: Result<axum::Json<CheckRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let axum::Json(body) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let scope = match (body.scope, body.credential_id) {
        (ScopeKind::Pool, None) => Scope::Pool,
        (ScopeKind::Pool, Some(_)) => {
            return Err(ApiError::InvalidRequest(
                "credential_id is only valid with scope \"credential\"".into(),
            ));
        }
        (ScopeKind::Credential, Some(id)) => {
            if !state.pool.credential_ids().await.contains(&id) {
                return Err(geonames_quota::Error::NotFound(id).into());
            }
            Scope::Credential(id)
        }
        (ScopeKind::Credential, None) => {
            return Err(ApiError::InvalidRequest(
                "scope \"credential\" needs a credential_id".into(),
            ));
        }
    };

    let decision = state.pool.limiter().check(&scope)?;
    let scope_label = scope.to_string();
    let response = match decision {
        RateLimitDecision::Allow => json_response(
            StatusCode::OK,
            serde_json::json!({ "decision": "allow", "scope": scope_label }),
        ),
        RateLimitDecision::Deny {
            retry_after,
            window,
        }
        | RateLimitDecision::Reroute {
            retry_after,
            window,
        } => {
            let secs = retry_after_secs(retry_after);
            let mut response = json_response(
                StatusCode::TOO_MANY_REQUESTS,
                serde_json::json!({
                    "decision": decision.label(),
                    "scope": scope_label,
                    "window": window,
                    "retry_after_secs": secs,
                }),
            );
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
            response
        }
    };
    Ok(response)
}

/// POST /v1/leases
pub async fn acquire_handler(State(state): State<QuotaState>) -> Result<Response, ApiError> {
    let lease = match state.pool.acquire().await {
        Ok(lease) => lease,
        Err(e) => {
            metrics::record_lease("rejected");
            return Err(e.into());
        }
    };

    let body = serde_json::json!({
        "lease_id": lease.id(),
        "credential_id": lease.credential_id(),
        "username": lease.username(),
        "expires_in_secs": state.leases.ttl().as_secs(),
    });
    debug!(
        lease_id = lease.id(),
        credential_id = lease.credential_id(),
        "lease granted"
    );
    state.leases.insert(lease).await;
    metrics::record_lease("acquired");
    Ok(json_response(StatusCode::OK, body))
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum OutcomeKind {
    Success,
    AuthRejected,
    QuotaExceeded,
    Transient,
    Abandoned,
}

/// Either an explicit outcome or the raw provider response to classify.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReleaseRequest {
    #[serde(default)]
    outcome: Option<OutcomeKind>,
    /// Window that ran out, for `quota_exceeded`.
    #[serde(default)]
    window: Option<Window>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    provider_status: Option<u16>,
    #[serde(default)]
    provider_body: Option<String>,
}

impl ReleaseRequest {
    fn into_outcome(self) -> Result<Outcome, ApiError> {
        let provider_response = self.provider_status.is_some() || self.provider_body.is_some();
        match self.outcome {
            Some(_) if provider_response => Err(ApiError::InvalidRequest(
                "give either outcome or provider_status/provider_body, not both".into(),
            )),
            Some(kind) => {
                let message = self.message.unwrap_or_else(|| "reported by caller".into());
                Ok(match kind {
                    OutcomeKind::Success => Outcome::Success,
                    OutcomeKind::Abandoned => Outcome::Abandoned,
                    OutcomeKind::AuthRejected => {
                        Outcome::Failed(ProviderFailure::AuthRejected(message))
                    }
                    OutcomeKind::QuotaExceeded => Outcome::Failed(ProviderFailure::QuotaExceeded {
                        window: self.window,
                        message,
                    }),
                    OutcomeKind::Transient => Outcome::Failed(ProviderFailure::Transient(message)),
                })
            }
            None => match (self.provider_status, self.provider_body) {
                (Some(status), body) => Ok(classify_status(status, body.as_deref().unwrap_or(""))),
                (None, Some(body)) => Ok(classify_body(&body)),
                (None, None) => Err(ApiError::InvalidRequest(
                    "release needs an outcome or a provider response".into(),
                )),
            },
        }
    }
}

/// POST /v1/leases/{lease_id}/release
pub async fn release_handler(
    State(state): State<QuotaState>,
    Path(lease_id): Path<String>,
    body: Result<axum::Json<ReleaseRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let axum::Json(body) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let outcome = body.into_outcome()?;

    let lease = state
        .leases
        .take(&lease_id)
        .await
        .ok_or_else(|| ApiError::LeaseNotFound(lease_id.clone()))?;
    let credential_id = lease.credential_id().to_string();
    let label = outcome.label();

    state.pool.release(lease, outcome).await?;
    metrics::record_lease("released");
    info!(lease_id, credential_id, outcome = label, "lease released");

    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({
            "lease_id": lease_id,
            "credential_id": credential_id,
            "outcome": label,
        }),
    ))
}
